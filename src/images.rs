//! Image hosting.
//!
//! Uploads arrive as `data:image/...;base64,` URIs and are kept in the
//! document store under `image:{file}`, served back at `/images/{file}`.
//! Already-hosted `http(s)` URLs are accepted as they are and never deleted.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http::StatusCode;
use mime_guess::from_path;
use spin_sdk::http::Response;
use tracing::{debug, warn};

use crate::config::{image_key, public_url, MAX_IMAGE_BYTES};
use crate::core::errors::ApiError;
use crate::core::helpers::new_id;
use crate::core::store::DocumentStore;

const ROUTE_PREFIX: &str = "/images/";

/// Raster formats only. SVG can carry script, so it is never hosted.
fn extension_for(mime: &str) -> Option<&'static str> {
    match mime {
        "image/png" => Some("png"),
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        _ => None,
    }
}

fn is_remote(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// File name of an image hosted here, if `url` points at one.
fn hosted_file(url: &str) -> Option<&str> {
    let prefix = format!("{}{}", public_url(), ROUTE_PREFIX);
    let file = url.strip_prefix(prefix.as_str())?;
    (!file.is_empty() && !file.contains('/')).then_some(file)
}

/// Stores an image and returns the URL to save on the document.
pub fn upload<S: DocumentStore>(store: &S, image: &str) -> Result<String, ApiError> {
    if is_remote(image) {
        return Ok(image.to_string());
    }

    let rest = image
        .strip_prefix("data:")
        .ok_or_else(|| ApiError::bad_request("Image must be a data URI or URL"))?;
    let (mime, payload) = rest
        .split_once(";base64,")
        .ok_or_else(|| ApiError::bad_request("Image must be base64 encoded"))?;
    let ext = extension_for(&mime.to_ascii_lowercase())
        .ok_or_else(|| ApiError::bad_request("Unsupported image type"))?;

    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|_| ApiError::bad_request("Image is not valid base64"))?;
    if bytes.is_empty() {
        return Err(ApiError::bad_request("Image is empty"));
    }
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(ApiError::bad_request("Image too large (max 5 MiB)"));
    }

    let file = format!("{}.{}", new_id(), ext);
    store.set(&image_key(&file), &bytes)?;
    debug!(file = %file, size = bytes.len(), "image stored");
    Ok(format!("{}{}{}", public_url(), ROUTE_PREFIX, file))
}

/// Deletes a hosted image. Remote URLs are left alone.
pub fn destroy<S: DocumentStore>(store: &S, url: &str) -> anyhow::Result<()> {
    if url.is_empty() {
        return Ok(());
    }
    match hosted_file(url) {
        Some(file) => store.delete(&image_key(file)),
        None => {
            debug!(url = %url, "not a hosted image, skipping delete");
            Ok(())
        }
    }
}

/// Best-effort delete used after the owning document is already gone.
pub fn destroy_logged<S: DocumentStore>(store: &S, url: &str) {
    if let Err(e) = destroy(store, url) {
        warn!(url = %url, error = ?e, "failed to delete hosted image");
    }
}

pub fn serve<S: DocumentStore>(store: &S, file: &str) -> Result<Response, ApiError> {
    let bytes = store
        .get(&image_key(file))?
        .ok_or_else(|| ApiError::not_found("Image not found"))?;
    let mime = from_path(file).first_or_octet_stream();

    Ok(Response::builder()
        .status(StatusCode::OK.as_u16())
        .header("Content-Type", mime.to_string())
        .header("Cache-Control", "public, max-age=31536000, immutable")
        .header("X-Content-Type-Options", "nosniff")
        .header("Content-Security-Policy", "sandbox")
        .body(bytes)
        .build())
}
