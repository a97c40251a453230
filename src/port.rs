use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_serial::{FlowControl, SerialPortBuilderExt};
use tracing::{debug, info};
use crate::config::{AshConfig, PortPath};

/// A byte stream to the NCP. Anything that can be read and written asynchronously qualifies,
///  which allows tests to use in-memory streams.
pub trait AshPort: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AshPort for T {}

/// This trait decouples the protocol driver from the way the connection to the NCP is
///  established.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PortOpener: Send + Sync + 'static {
    async fn open(&self, config: &AshConfig) -> anyhow::Result<Box<dyn AshPort>>;
}

/// Opens serial devices through `tokio-serial`, and `tcp://` paths as a TCP connection
#[derive(Debug, Default)]
pub struct DefaultPortOpener;

#[async_trait]
impl PortOpener for DefaultPortOpener {
    async fn open(&self, config: &AshConfig) -> anyhow::Result<Box<dyn AshPort>> {
        match &config.path {
            PortPath::Serial(device) => {
                let flow_control = if config.rtscts {
                    FlowControl::Hardware
                }
                else {
                    FlowControl::Software
                };
                debug!("opening serial port {} at {} baud, flow control {:?}", device, config.baud_rate, flow_control);

                let port = tokio_serial::new(device.as_str(), config.baud_rate)
                    .flow_control(flow_control)
                    .open_native_async()?;
                info!("opened serial port {}", device);
                Ok(Box::new(port))
            }
            PortPath::Tcp { host, port } => {
                debug!("connecting to {}:{}", host, port);
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                stream.set_nodelay(true)?;
                info!("connected to {}", config.path);
                Ok(Box::new(stream))
            }
        }
    }
}
