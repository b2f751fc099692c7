use std::sync::Arc;
use std::{fs::File, io::BufReader};

use anyhow::{Error, anyhow};
use rustls_pemfile::{certs, private_key};
use serde::{Deserialize, Deserializer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

use palaver_core::xml::stream_codec::DEFAULT_MAX_STANZA_SIZE;

#[derive(Debug, Deserialize)]
struct TlsMaterial {
    cert_file: String,
    key_file: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsSettings {
    #[serde(default)]
    pub required: bool,
    #[serde(deserialize_with = "init_tls_server_config")]
    pub server_config: Arc<ServerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BindSettings {
    #[serde(default)]
    pub required: bool,
}

impl Default for BindSettings {
    fn default() -> Self {
        Self { required: false }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserSettings {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub domain: String,
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_max_stanza_size")]
    pub max_stanza_size: usize,
    #[serde(default = "default_close_grace_secs")]
    pub close_grace_secs: u64,
    #[serde(default = "default_scram_iterations")]
    pub scram_iterations: u32,
    #[serde(default = "default_compression")]
    pub compression: Vec<String>,
    #[serde(default)]
    pub tls: Option<TlsSettings>,
    #[serde(default)]
    pub bind: BindSettings,
    #[serde(default)]
    pub users: Vec<UserSettings>,
}

impl Settings {
    pub fn init() -> Result<Self, Error> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("config/defaults"))
            .add_source(config::File::with_name("config/overrides").required(false))
            .add_source(config::Environment::with_prefix("PALAVER").separator("__"))
            .build()?;

        settings.try_deserialize().map_err(|err| anyhow!(err))
    }

    pub fn tls_server_config(&self) -> Option<Arc<ServerConfig>> {
        self.tls.as_ref().map(|tls| tls.server_config.clone())
    }
}

fn default_listen() -> String {
    "127.0.0.1:5222".to_string()
}

fn default_max_stanza_size() -> usize {
    DEFAULT_MAX_STANZA_SIZE
}

fn default_close_grace_secs() -> u64 {
    2
}

fn default_scram_iterations() -> u32 {
    4096
}

fn default_compression() -> Vec<String> {
    vec!["zlib".to_string()]
}

fn init_tls_server_config<'d, D: Deserializer<'d>>(
    deserializer: D,
) -> Result<Arc<ServerConfig>, D::Error> {
    let material = TlsMaterial::deserialize(deserializer)?;

    let cert_file =
        &mut BufReader::new(File::open(&material.cert_file).map_err(serde::de::Error::custom)?);
    let cert_chain: Vec<CertificateDer<'static>> = certs(cert_file)
        .collect::<Result<_, _>>()
        .map_err(serde::de::Error::custom)?;

    let key_file =
        &mut BufReader::new(File::open(&material.key_file).map_err(serde::de::Error::custom)?);
    let key_der: PrivateKeyDer<'static> = private_key(key_file)
        .map_err(serde::de::Error::custom)?
        .ok_or_else(|| serde::de::Error::custom("no private key in key file"))?;

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key_der)
        .map_err(serde::de::Error::custom)?;

    Ok(Arc::new(server_config))
}
