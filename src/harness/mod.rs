pub mod failure;
pub mod line_buffer;
