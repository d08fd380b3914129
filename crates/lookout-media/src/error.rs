use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("camera access denied: {0}")]
    PermissionDenied(String),
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    /// The stream has not produced a usable frame yet.
    #[error("no frame available from stream")]
    NoFrame,
    #[error("image encoding failed: {0}")]
    Encode(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl MediaError {
    /// Map an OS error from opening a device node onto the camera taxonomy.
    pub fn from_open_error(device_path: &str, err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EACCES) | Some(libc::EPERM) => {
                MediaError::PermissionDenied(format!("{device_path}: {err}"))
            }
            Some(libc::EBUSY) => MediaError::DeviceBusy,
            Some(libc::ENOENT) | Some(libc::ENODEV) | Some(libc::ENXIO) => {
                MediaError::DeviceNotFound(format!("{device_path}: {err}"))
            }
            _ if err.kind() == std::io::ErrorKind::PermissionDenied => {
                MediaError::PermissionDenied(format!("{device_path}: {err}"))
            }
            _ => MediaError::DeviceNotFound(format!("{device_path}: {err}")),
        }
    }
}
