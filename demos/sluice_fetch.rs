use std::io::Write;
use std::sync::Mutex;

use clap::{Parser, ValueEnum};
use sluice::bytes::Bytes;
use sluice::http::{Method, Request, Uri};
use sluice::{AsyncHttpClient, ClientConfig, Protocol, ResponseHandler, ResponseHead, StreamedBody};
use sluice_tokio::{TokioRuntime, TokioTransport};
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ProtocolArg {
    Auto,
    Http1,
    Http2,
}

impl From<ProtocolArg> for Protocol {
    fn from(protocol: ProtocolArg) -> Self {
        match protocol {
            ProtocolArg::Auto => Protocol::Auto,
            ProtocolArg::Http1 => Protocol::Http1,
            ProtocolArg::Http2 => Protocol::Http2,
        }
    }
}

/// A simple curl-like HTTP client using `sluice`.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// The URL to request
    uri: Uri,

    /// HTTP method to use
    #[arg(short = 'X', long, default_value_t = Method::GET)]
    method: Method,

    /// Custom headers (can be used multiple times)
    #[arg(short = 'H', long)]
    headers: Vec<String>,

    /// Request body
    #[arg(short, long)]
    data: Option<String>,

    /// Protocol preference
    #[arg(long, value_enum, default_value_t = ProtocolArg::Auto)]
    protocol: ProtocolArg,

    /// Skip TLS certificate verification
    #[arg(short = 'k', long)]
    insecure: bool,

    /// Trace every byte read from and written to the connection
    #[arg(long)]
    wire_log: bool,
}

/// Prints the response as it arrives.
struct Printer {
    done: Mutex<Option<oneshot::Sender<anyhow::Result<()>>>>,
}

impl Printer {
    fn finish(&self, result: anyhow::Result<()>) {
        let done = self.done.lock().ok().and_then(|mut done| done.take());
        if let Some(done) = done {
            let _ = done.send(result);
        }
    }
}

impl ResponseHandler for Printer {
    fn headers_received(&self, response: ResponseHead) {
        println!("{} {}", response.status_code(), response.status_text());
        for (name, values) in response.headers() {
            for value in values {
                println!("{name}: {value}");
            }
        }
        println!();
    }

    fn body_part_received(&self, part: Bytes) {
        let _ = std::io::stdout().write_all(&part);
    }

    fn on_stream(&self, body: StreamedBody) {
        self.body_part_received(body.into_bytes());
    }

    fn exception_occurred(&self, error: anyhow::Error) {
        self.finish(Err(error));
    }

    fn complete(&self) {
        let _ = std::io::stdout().flush();
        self.finish(Ok(()));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Config::parse();

    let filter = if args.wire_log {
        EnvFilter::new("sluice=trace")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let _ = rustls::crypto::ring::default_provider().install_default();

    let transport = TokioTransport::builder()
        .with_trust_all_certificates(args.insecure)
        .build()?;
    let config = ClientConfig::default()
        .with_protocol(args.protocol.into())
        .with_wire_logging(args.wire_log);
    let client = AsyncHttpClient::new(transport, TokioRuntime, config);

    let mut request = Request::builder().method(args.method.clone()).uri(args.uri.clone());
    for header in &args.headers {
        if let Some((name, value)) = header.split_once(':') {
            request = request.header(name.trim(), value.trim());
        }
    }
    let request = request.body(())?;

    let (done, finished) = oneshot::channel();
    let printer = Printer {
        done: Mutex::new(Some(done)),
    };
    let body = args.data.map(String::into_bytes).unwrap_or_default();
    let _executor = client.execute(request, body, printer)?;

    let result = finished.await?;
    client.close();
    result
}
