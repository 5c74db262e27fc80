pub mod clockadj;
pub mod dynconfig;
pub mod error;
pub mod ethtool;
pub mod filter;
pub mod monitor;
pub mod phc;
pub mod pipeline;
pub mod pps;
pub mod ptpclient;
pub mod quality;
pub mod ringbuffer;
pub mod servo;
pub mod sysoff;
pub mod traits;
