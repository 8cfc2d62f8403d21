//! Native server: actix-web in front of the shared router, backed by an
//! in-process [`MemoryStore`].

use actix_web::http::StatusCode;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{bind_addr, seed_demo, MAX_IMAGE_BYTES};
use crate::core::db::seed_demo_data;
use crate::core::store::MemoryStore;
use crate::route;

mod adapter {
    use spin_sdk::http::{Method, Request, Response};

    /// Owned request parts, so they can cross into the blocking pool.
    pub struct Incoming {
        pub method: String,
        pub uri: String,
        pub headers: Vec<(String, String)>,
        pub body: Vec<u8>,
    }

    pub struct Outgoing {
        pub status: u16,
        pub headers: Vec<(String, String)>,
        pub body: Vec<u8>,
    }

    pub fn to_spin_request(incoming: Incoming) -> Request {
        // Unknown methods match no route.
        let method = match incoming.method.as_str() {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "HEAD" => Method::Head,
            "PATCH" => Method::Patch,
            _ => Method::Options,
        };

        let mut builder = Request::builder();
        builder.method(method).uri(incoming.uri);
        for (name, value) in incoming.headers {
            builder.header(name, value);
        }
        builder.body(incoming.body).build()
    }

    pub fn from_spin_response(resp: Response) -> Outgoing {
        let headers = resp
            .headers()
            .filter_map(|(name, value)| value.as_str().map(|v| (name.to_string(), v.to_string())))
            .collect();
        Outgoing {
            status: *resp.status(),
            headers,
            body: resp.body().to_vec(),
        }
    }
}

/// Mounts the router as a catch-all. Expects `web::Data<MemoryStore>` in app data.
pub fn configure(cfg: &mut web::ServiceConfig) {
    // Base64 inflates images by a third; leave room for the JSON around them.
    cfg.app_data(web::PayloadConfig::new(MAX_IMAGE_BYTES * 2))
        .route("/{tail:.*}", web::route().to(handle_all));
}

async fn handle_all(
    req: HttpRequest,
    body: web::Bytes,
    store: web::Data<MemoryStore>,
) -> HttpResponse {
    let incoming = adapter::Incoming {
        method: req.method().as_str().to_string(),
        uri: req.uri().to_string(),
        headers: req
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect(),
        body: body.to_vec(),
    };

    let store = store.into_inner();
    let outgoing = web::block(move || {
        let response = route(&*store, adapter::to_spin_request(incoming));
        adapter::from_spin_response(response)
    })
    .await;

    match outgoing {
        Ok(out) => {
            let status =
                StatusCode::from_u16(out.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let mut response = HttpResponse::build(status);
            for (name, value) in out.headers {
                response.append_header((name, value));
            }
            response.body(out.body)
        }
        Err(e) => {
            error!(error = %e, "handler panicked or was cancelled");
            HttpResponse::InternalServerError()
                .json(serde_json::json!({"error": "Internal server error"}))
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

pub async fn run() -> std::io::Result<()> {
    init_tracing();

    let store = web::Data::new(MemoryStore::new());
    if seed_demo() {
        match seed_demo_data(store.get_ref()) {
            Ok(()) => info!("demo data seeded"),
            Err(e) => warn!(error = %e, "failed to seed demo data"),
        }
    }

    let addr = bind_addr();
    info!(addr = %addr, "server listening");

    HttpServer::new(move || App::new().app_data(store.clone()).configure(configure))
        .bind(addr)?
        .run()
        .await
}
