pub mod progress;

pub use progress::{
    ProgressSampler,
    Sample,
    estimate_eta,
    format_bytes,
    format_duration,
    format_eta,
    format_speed,
    percentage,
};
