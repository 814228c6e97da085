//! Device register map

/// Control channel privilege; writing 3 grants exclusive control
pub const CONTROL_PRIVILEGE: u32 = 0x0A00;
/// Value written to [`CONTROL_PRIVILEGE`] on connect
pub const CONTROL_PRIVILEGE_EXCLUSIVE: u32 = 0x03;
/// Device-side heartbeat timeout in milliseconds
pub const HEARTBEAT_TIMEOUT: u32 = 0x0938;
/// Persistent IP address
pub const NETWORK_IP: u32 = 0x064C;
/// Persistent subnet mask
pub const NETWORK_NETMASK: u32 = 0x065C;
/// Persistent default gateway
pub const NETWORK_GATEWAY: u32 = 0x066C;

/// Host port image data is streamed to
pub const STREAM_HOST_PORT: u32 = 0x0D00;
/// Stream packet size including IP and UDP headers
pub const STREAM_PACKET_SIZE: u32 = 0x0D04;
/// Delay between stream packets
pub const STREAM_PACKET_DELAY: u32 = 0x0D08;
/// Stream destination IPv4 address
pub const STREAM_DESTINATION: u32 = 0x0D18;

/// Writing 1 arms the acquisition sequence
pub const ACQUISITION_SEQUENCE: u32 = 0xA000;
/// Sensor width in pixels (read only)
pub const SENSOR_WIDTH: u32 = 0xA004;
/// Sensor height in pixels (read only)
pub const SENSOR_HEIGHT: u32 = 0xA008;

/// Writing 1 starts an exposure
pub const EXPOSURE_START: u32 = 0x0002_0000;
/// Analog gain index
pub const GAIN: u32 = 0x0002_0008;
/// Shutter mode, see [`SHUTTER_NORMAL`] and [`SHUTTER_CLOSED`]
pub const SHUTTER_MODE: u32 = 0x0002_000C;
/// Exposure time in microseconds
pub const EXPOSURE_TIME_US: u32 = 0x0002_0010;
/// Writing 1 aborts the running exposure
pub const EXPOSURE_ABORT: u32 = 0x0002_0050;

pub const SHUTTER_NORMAL: u32 = 0;
pub const SHUTTER_CLOSED: u32 = 2;

/// Highest gain index the device accepts
pub const GAIN_MAX: u32 = 2;
