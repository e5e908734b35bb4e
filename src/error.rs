use thiserror::Error;

/// Errors of the host side. Messages read as the continuation of "Failed".
#[derive(Error, Debug)]
pub enum Error {
    #[error("to find a CC2531 dongle running the stock sniffer firmware.")]
    NoDevice,
    #[error("to access device: Permission denied.")]
    PermissionDenied,
    #[error("to inject: firmware revision {0:#06x} is not supported. Please open an issue.")]
    UnsupportedDevice(u16),
    #[error("because no binary was given.")]
    NoPayload,
    #[error("because the payload is {len} bytes and at most {max} fit.")]
    PayloadTooBig { len: usize, max: usize },
    #[error("because the image is {len} bytes and only {max} bytes of SRAM are free.")]
    ImageTooBig { len: usize, max: usize },
    #[error("to write to {0:#06x}: the write pointer cannot reach it.")]
    AddressOutOfRange(u16),
    #[error(
        "to find the dongle again{}. Try unplugging it and plugging it back in.",
        .0.map(|err| format!(" (last error: {})", err)).unwrap_or_default()
    )]
    DeviceLost(Option<rusb::Error>),
    #[error("because the device took {len} of {expected} bytes.")]
    ShortTransfer { len: usize, expected: usize },
    #[error("due to an I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("due an unknown usb error: {0}")]
    UnknownUsbError(#[from] rusb::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_lost_names_last_error() {
        assert_eq!(
            Error::DeviceLost(None).to_string(),
            "to find the dongle again. Try unplugging it and plugging it back in."
        );
        let message = Error::DeviceLost(Some(rusb::Error::Access)).to_string();
        assert!(message.starts_with("to find the dongle again (last error: "));
        assert!(message.contains(&rusb::Error::Access.to_string()));
    }
}
