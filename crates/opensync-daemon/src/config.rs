use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;

/// Command-line flags, each falling back to an `OPENSYNC_*` environment variable.
#[derive(Debug, Clone, Parser)]
#[command(name = "opensyncd")]
#[command(about = "Receives files over UDP and sends uploaded files to peers")]
pub struct Args {
    /// Address both listeners bind to
    #[arg(long, env = "OPENSYNC_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// HTTP control-plane port
    #[arg(long, env = "OPENSYNC_API_PORT", default_value_t = 8080)]
    pub api_port: u16,

    /// UDP receive port
    #[arg(long, env = "OPENSYNC_UDP_PORT", default_value_t = 8081)]
    pub udp_port: u16,

    /// Where received files are written
    #[arg(long, env = "OPENSYNC_DOWNLOAD_DIR", default_value = "./downloads")]
    pub download_dir: PathBuf,
}

impl Args {
    pub fn api_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.api_port)
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.udp_port)
    }
}
