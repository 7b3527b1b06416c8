use bitflags::bitflags;

bitflags! {
    /// Out-of-band error conditions raised asynchronously by the wire layer.
    ///
    /// The orchestrator polls these once per frame; any bit set means the
    /// remote image state is no longer trustworthy.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ErrorFlags: u32 {
        /// A command referenced an image id the remote does not know.
        const UNKNOWN_ID = 0x1;
        /// The remote applied fewer bytes than a write carried.
        const SHORT_WRITE = 0x2;
        /// The connection was reset underneath us.
        const CONNECTION_RESET = 0x4;
    }
}
