use std::fmt::{Display, Formatter};
use anyhow::bail;
use crate::consts::{DEFAULT_BAUD_RATE, VALID_BAUD_RATES};

/// Where the NCP is attached: a local serial device, or a serial-over-TCP bridge
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PortPath {
    Serial(String),
    Tcp { host: String, port: u16 },
}

impl Display for PortPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PortPath::Serial(device) => write!(f, "{}", device),
            PortPath::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
        }
    }
}

impl PortPath {
    /// Anything starting with `tcp` must have the form `tcp://<host>:<port>`, everything else is
    ///  treated as the name of a serial device.
    pub fn parse(path: &str) -> anyhow::Result<PortPath> {
        if !path.starts_with("tcp") {
            if path.is_empty() {
                bail!("empty serial port name");
            }
            return Ok(PortPath::Serial(path.to_string()));
        }

        let Some(addr) = path.strip_prefix("tcp://") else {
            bail!("invalid TCP port path {:?}, expected tcp://<host>:<port>", path);
        };
        let Some((host, port)) = addr.rsplit_once(':') else {
            bail!("TCP port path {:?} has no port number", path);
        };
        if host.is_empty() {
            bail!("TCP port path {:?} has no host", path);
        }
        let port = match port.parse::<u16>() {
            Ok(port) if port != 0 => port,
            _ => bail!("invalid port number in TCP port path {:?}", path),
        };

        Ok(PortPath::Tcp { host: host.to_string(), port })
    }

    pub fn is_serial(&self) -> bool {
        matches!(self, PortPath::Serial(_))
    }
}

#[derive(Debug, Clone)]
pub struct AshConfig {
    pub path: PortPath,

    /// Only relevant for serial ports, must be one of the standard rates between 600 and 460800
    pub baud_rate: u32,

    /// Hardware (RTS / CTS) flow control for serial ports. Without it, software flow control is
    ///  requested from the serial driver, and XON / XOFF bytes that still reach the protocol layer
    ///  are treated as a fatal misconfiguration.
    pub rtscts: bool,
}

impl AshConfig {
    pub fn new(path: PortPath) -> AshConfig {
        AshConfig {
            path,
            baud_rate: DEFAULT_BAUD_RATE,
            rtscts: false,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.path.is_serial() && !VALID_BAUD_RATES.contains(&self.baud_rate) {
            bail!("unsupported baud rate {}", self.baud_rate);
        }

        Ok(())
    }

    /// true if XON / XOFF bytes reaching the decoder indicate a misconfigured serial port
    pub fn xon_xoff_is_error(&self) -> bool {
        self.path.is_serial() && !self.rtscts
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::serial("/dev/ttyUSB0", PortPath::Serial("/dev/ttyUSB0".to_string()))]
    #[case::windows("COM3", PortPath::Serial("COM3".to_string()))]
    #[case::tcp("tcp://192.168.1.5:8888", PortPath::Tcp { host: "192.168.1.5".to_string(), port: 8888 })]
    #[case::tcp_hostname("tcp://ncp.local:6638", PortPath::Tcp { host: "ncp.local".to_string(), port: 6638 })]
    fn test_parse(#[case] path: &str, #[case] expected: PortPath) {
        assert_eq!(PortPath::parse(path).unwrap(), expected);
        assert_eq!(expected.to_string(), path);
    }

    #[rstest]
    #[case::empty("")]
    #[case::no_scheme_separator("tcp:host:1")]
    #[case::no_port("tcp://host")]
    #[case::empty_host("tcp://:1234")]
    #[case::bad_port("tcp://host:abc")]
    #[case::port_out_of_range("tcp://host:70000")]
    #[case::port_zero("tcp://host:0")]
    fn test_parse_invalid(#[case] path: &str) {
        assert!(PortPath::parse(path).is_err());
    }

    #[rstest]
    #[case::default(DEFAULT_BAUD_RATE, true)]
    #[case::slowest(600, true)]
    #[case::fastest(460800, true)]
    #[case::odd(100000, false)]
    #[case::zero(0, false)]
    fn test_validate_baud_rate(#[case] baud_rate: u32, #[case] valid: bool) {
        let mut config = AshConfig::new(PortPath::Serial("/dev/ttyACM0".to_string()));
        config.baud_rate = baud_rate;
        assert_eq!(config.validate().is_ok(), valid);
    }

    #[test]
    fn test_baud_rate_irrelevant_for_tcp() {
        let mut config = AshConfig::new(PortPath::Tcp { host: "localhost".to_string(), port: 1 });
        config.baud_rate = 1;
        assert!(config.validate().is_ok());
    }

    #[rstest]
    #[case::serial_sw_flow_control(PortPath::Serial("/dev/ttyS0".to_string()), false, true)]
    #[case::serial_rtscts(PortPath::Serial("/dev/ttyS0".to_string()), true, false)]
    #[case::tcp(PortPath::Tcp { host: "localhost".to_string(), port: 1 }, false, false)]
    fn test_xon_xoff_is_error(#[case] path: PortPath, #[case] rtscts: bool, #[case] expected: bool) {
        let mut config = AshConfig::new(path);
        config.rtscts = rtscts;
        assert_eq!(config.xon_xoff_is_error(), expected);
    }
}
