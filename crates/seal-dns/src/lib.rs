mod app;
pub use app::App;
mod cli;
pub use cli::Args;
mod logging;
pub use logging::setup_logging;
mod estimator;
pub use estimator::QuestionSizeEstimator;
mod listener;
pub use listener::DnsListener;
pub mod pipeline;
pub mod plugins;
mod prefetch;
pub use prefetch::ReloadableList;
mod proxy;
pub use proxy::{ClientCounter, Proxy, ProxyConfig};
mod servers;
pub use servers::{RegisteredServer, ServerInfo, ServerProto, ServersInfo};
mod socket;
pub use socket::OobUdpSocket;
pub mod transport;
