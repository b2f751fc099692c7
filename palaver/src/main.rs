use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use clap::Parser;
use tokio::net::{TcpListener, TcpStream};
use tracing::info;
use tracing_subscriber::EnvFilter;

use palaver_backend::settings::Settings;
use palaver_backend::store::MemoryUserStore;
use palaver_core::compress::CompressionMethod;
use palaver_inbound::c2s::C2s;
use palaver_inbound::connection::TcpConnection;
use palaver_inbound::sasl::{self, Mechanism};
use palaver_services::echo::{EchoHandler, MessageRouter};
use palaver_services::router::RouterHandle;

#[derive(Parser)]
#[command(about = "A small XMPP server on the palaver stream core")]
struct Cli {
    /// Listen address override, e.g. 127.0.0.1:5222.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::init()?;
    if let Some(listen) = cli.listen {
        settings.listen = listen;
    }

    let store = Arc::new(MemoryUserStore::new());
    for user in &settings.users {
        store.add_user(&user.username, &user.password, settings.scram_iterations);
    }

    let router = RouterHandle::new();
    let listener = TcpListener::bind(&settings.listen).await?;
    info!("listening on {} for domain {}", settings.listen, settings.domain);

    loop {
        let (socket, remote) = listener.accept().await?;
        info!(%remote, "accepted connection");

        let settings = settings.clone();
        let store = store.clone();
        let router = router.clone();
        tokio::spawn(async move {
            serve_connection(socket, settings, store, router).await;
        });
    }
}

async fn serve_connection(
    socket: TcpStream,
    settings: Settings,
    store: Arc<MemoryUserStore>,
    router: RouterHandle,
) {
    let tls_config = settings.tls_server_config();
    let with_tls = tls_config.is_some();
    let tls_required = settings.tls.as_ref().is_some_and(|tls| tls.required);
    let connection = TcpConnection::new(socket, tls_config);

    let mut c2s = C2s::new(connection, &settings.domain, settings.max_stanza_size)
        .with_close_grace(Duration::from_secs(settings.close_grace_secs))
        .with_sasl(Arc::new(router.clone()))
        .with_sasl_support(sasl::PLAIN, Mechanism::plain(store.clone()))
        .with_sasl_support(sasl::SCRAM_SHA_1, Mechanism::scram_sha1(store.clone(), false))
        .with_sasl_support(
            sasl::SCRAM_SHA_256,
            Mechanism::scram_sha256(store.clone(), false),
        )
        .with_sasl_support(
            sasl::SCRAM_SHA_512,
            Mechanism::scram_sha512(store.clone(), false),
        )
        .with_bind(Arc::new(router.clone()), settings.bind.required)
        .with_elem_handler(Box::new(MessageRouter::new(router.clone())))
        .with_elem_handler(Box::new(EchoHandler));

    if with_tls {
        c2s = c2s
            .with_tls(tls_required)
            .with_sasl_support(
                sasl::SCRAM_SHA_1_PLUS,
                Mechanism::scram_sha1(store.clone(), true),
            )
            .with_sasl_support(
                sasl::SCRAM_SHA_256_PLUS,
                Mechanism::scram_sha256(store.clone(), true),
            )
            .with_sasl_support(
                sasl::SCRAM_SHA_512_PLUS,
                Mechanism::scram_sha512(store.clone(), true),
            );
    }
    for method_name in &settings.compression {
        if let Some(method) = CompressionMethod::from_name(method_name) {
            c2s = c2s.with_compress_support(method_name, method);
        }
    }

    c2s.start().await;
}
