use std::net::SocketAddr;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "127.0.0.1:3000")]
    pub address: SocketAddr,

    #[envconfig(default = "redis://localhost:6379/")]
    pub redis_url: String,

    #[envconfig(default = "monitoring-data")]
    pub queue_name: String,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    #[envconfig(default = "1000000")]
    pub max_body_size: usize,
}
