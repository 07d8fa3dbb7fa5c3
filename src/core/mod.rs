pub mod error;
pub mod registry;
pub mod session;
pub mod transport;

pub use error::DeviceError;
pub use registry::{DeviceEvent, DeviceRegistry};
pub use session::{DeviceSession, TransportGuard};
pub use transport::{DeviceTransport, FileHandle, FileStat, OpenMode, TransportError};
