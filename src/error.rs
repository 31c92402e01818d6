/// Setup-time failures surfaced to the caller.
///
/// Runtime stream anomalies (short frames, pool exhaustion, dropped
/// exposures, stale observations) are logged and accounted where they
/// happen and never travel through `Result`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("unrecognized camera product {vid:04x}:{pid:04x}")]
    UnknownProduct { vid: u16, pid: u16 },

    #[error("UVC {0} negotiation failed")]
    Negotiation(&'static str),

    #[error("failed to allocate isochronous transfer")]
    TransferAlloc,

    #[error("stream is already running")]
    AlreadyStreaming,

    #[error("device roster is full")]
    TooManyDevices,

    #[error("sensor roster is full")]
    TooManySensors,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
