pub mod butterworth;

pub use butterworth::ButterworthFilter;
