pub mod cpu;
pub mod stub;

pub use cpu::CpuMotionBackend;
pub use stub::StubBackend;
