pub mod context;
pub mod device;
pub mod model;
pub mod params;
pub mod pcm_decode;
pub mod processor;
pub mod voxtral;
