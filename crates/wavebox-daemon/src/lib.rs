pub mod codec;
pub mod decoder;
pub mod display;
pub mod engine;
pub mod http;
pub mod input;
pub mod net;
pub mod playback;
