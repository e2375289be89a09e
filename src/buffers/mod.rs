pub mod big_buffer;
pub mod fixed_buffer;
pub mod frame_pool;
