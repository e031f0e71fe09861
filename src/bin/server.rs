//! HTTP server exposing the geosql tools.
//! Plain tokio listener, one task per connection.

use anyhow::{Context, Result};
use clap::Parser;
use geosql::api::{
    GeoSqlService, LoadSpatialDatasetRequest, ProposeSqlRequest, RunSqlRequest, RunSqlSmartRequest, ToolRequest,
};
use geosql::AppConfig;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

#[derive(Parser)]
#[command(name = "geosql-server")]
#[command(about = "Self-correcting natural-language SQL over geospatial relations")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    bind: String,

    /// Extra .env file to load before reading the environment
    #[arg(long)]
    env_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    match &args.env_file {
        Some(path) => {
            dotenv::from_path(path).with_context(|| format!("cannot load {}", path.display()))?;
        }
        None => {
            dotenv::dotenv().ok();
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Arc::new(AppConfig::from_env()?);
    let service = Arc::new(GeoSqlService::from_config(config).context("cannot build service")?);

    let listener = TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("cannot bind {}", args.bind))?;
    info!("🚀 geosql server listening on {}", args.bind);

    loop {
        let (stream, addr) = listener.accept().await?;
        info!("📥 New connection from: {}", addr);
        tokio::spawn(handle_connection(stream, Arc::clone(&service)));
    }
}

async fn handle_connection(mut stream: TcpStream, service: Arc<GeoSqlService>) {
    let response = match read_request(&mut stream).await {
        Ok(Some(request)) => handle_request(request, &service).await,
        Ok(None) => return,
        Err(e) => {
            warn!("Bad request: {}", e);
            create_response(400, "Bad Request", &error_body(&e.to_string()))
        }
    };

    if let Err(e) = stream.write_all(response.as_bytes()).await {
        error!("Failed to write response: {}", e);
    }
}

struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

/// Read the head, then exactly `Content-Length` body bytes.
async fn read_request(stream: &mut TcpStream) -> Result<Option<HttpRequest>> {
    let mut buffer = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            anyhow::bail!("connection closed before end of headers");
        }
        buffer.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if buffer.len() > MAX_BODY_BYTES {
            anyhow::bail!("request head too large");
        }
    };

    let head = String::from_utf8_lossy(&buffer[..head_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default();
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 {
        anyhow::bail!("malformed request line");
    }

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_lowercase(), value.trim().to_string());
        }
    }
    let content_length: usize = match headers.get("content-length") {
        Some(raw) => raw.parse().context("invalid Content-Length")?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        anyhow::bail!("request body too large");
    }

    let mut body = buffer[head_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            anyhow::bail!("connection closed before end of body");
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    // drop query string and trailing slash
    let mut path = parts[1].split('?').next().unwrap_or("/").trim_end_matches('/').to_string();
    if path.is_empty() {
        path = "/".to_string();
    }
    Ok(Some(HttpRequest {
        method: parts[0].to_string(),
        path,
        body,
    }))
}

async fn handle_request(request: HttpRequest, service: &GeoSqlService) -> String {
    info!("🔍 Request: {} {}", request.method, request.path);

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/api/health") => create_response(200, "OK", r#"{"status":"ok","service":"geosql"}"#),
        ("OPTIONS", _) => create_response(204, "No Content", ""),
        ("POST", "/api/tools/load") => match parse_body::<LoadSpatialDatasetRequest>(&request.body) {
            Ok(req) => json_response(&service.load_spatial_dataset(req).await),
            Err(e) => create_response(400, "Bad Request", &error_body(&e)),
        },
        ("POST", "/api/tools/propose_sql") => match parse_body::<ProposeSqlRequest>(&request.body) {
            Ok(req) => json_response(&service.propose_sql(req).await),
            Err(e) => create_response(400, "Bad Request", &error_body(&e)),
        },
        ("POST", "/api/tools/run_sql") => match parse_body::<RunSqlRequest>(&request.body) {
            Ok(req) => json_response(&service.run_sql(req).await),
            Err(e) => create_response(400, "Bad Request", &error_body(&e)),
        },
        ("POST", "/api/tools/run_sql_smart") => match parse_body::<RunSqlSmartRequest>(&request.body) {
            Ok(req) => json_response(&service.run_sql_smart(req).await),
            Err(e) => create_response(400, "Bad Request", &error_body(&e)),
        },
        ("POST", "/api/tools") => match parse_body::<ToolRequest>(&request.body) {
            Ok(req) => json_response(&service.dispatch(req).await),
            Err(e) => create_response(400, "Bad Request", &error_body(&e)),
        },
        _ => create_response(404, "Not Found", &error_body("no such route")),
    }
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> std::result::Result<T, String> {
    serde_json::from_slice(body).map_err(|e| format!("invalid request body: {}", e))
}

fn json_response<T: serde::Serialize>(value: &T) -> String {
    match serde_json::to_string(value) {
        Ok(body) => create_response(200, "OK", &body),
        Err(e) => create_response(500, "Internal Server Error", &error_body(&e.to_string())),
    }
}

fn error_body(message: &str) -> String {
    serde_json::json!({ "error": message }).to_string()
}

fn create_response(status: u16, status_text: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status,
        status_text,
        body.len(),
        body
    )
}
