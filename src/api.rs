use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::{Buf, BufMut};
use futures_util::TryStreamExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use warp::http::Method;
use warp::hyper::{Body, StatusCode};
use warp::multipart::{FormData, Part};
use warp::{Filter, Rejection, Reply};

use crate::hash;
use crate::index::{unix_now, FileMeta, MetaIndex};
use crate::limit::RateLimit;
use crate::storage::{Storage, StorageError};

#[derive(Serialize, Deserialize)]
pub struct UploadResponse {
    pub hash: String,
}

#[derive(Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Shared handler state: the blob store, the metadata index and the
/// rate-limiting fabric.
pub struct AppState {
    pub storage: Arc<Storage>,
    pub index: Arc<dyn MetaIndex>,
    pub limits: RateLimit,
}

pub struct FileDropServer {
    state: Arc<AppState>,
    addr: SocketAddr,
}

impl FileDropServer {
    pub fn new(state: Arc<AppState>, addr: SocketAddr) -> Self {
        FileDropServer { state, addr }
    }

    /// Builds the warp filter chain for the file-drop API.
    pub fn create_api(
        &self,
    ) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
        self.upload()
            .or(self.download())
            .or(self.remove())
            .or(self.unmatched())
            .recover(handle_rejection)
    }

    /// POST /files - multipart upload
    fn upload(&self) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
        let state = self.state.clone();

        // the filter's own length cap is disabled; the upload cap is
        // enforced while the form is drained
        warp::path!("files")
            .and(warp::post())
            .and(warp::addr::remote())
            .and(warp::header::optional::<i64>("content-length"))
            .and(warp::multipart::form().max_length(u64::MAX))
            .and(warp::any().map(move || state.clone()))
            .and_then(handle_upload)
    }

    /// GET /files/{address} - verified download
    fn download(&self) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
        let state = self.state.clone();

        warp::path!("files" / String)
            .and(warp::get())
            .and(warp::addr::remote())
            .and(warp::any().map(move || state.clone()))
            .and_then(handle_download)
    }

    /// DELETE /files/{address}
    fn remove(&self) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
        let state = self.state.clone();

        warp::path!("files" / String)
            .and(warp::delete())
            .and(warp::addr::remote())
            .and(warp::any().map(move || state.clone()))
            .and_then(handle_remove)
    }

    /// Every other request on a `files`-shaped path, any method. The
    /// connection gate applies to these too; only the dispatch outcome is a
    /// 404.
    fn unmatched(&self) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
        let state = self.state.clone();

        let root = warp::path!("files").map(|| false);
        let entry = warp::path!("files" / String).map(|_address: String| true);

        root.or(entry)
            .unify()
            .and(warp::filters::method::method())
            .and(warp::addr::remote())
            .and(warp::any().map(move || state.clone()))
            .and_then(handle_unmatched)
    }

    /// Starts serving on the configured address.
    pub async fn run(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.state.storage.root())
            .await
            .with_context(|| {
                format!(
                    "failed to create storage directory: {}",
                    self.state.storage.root().display()
                )
            })?;

        let api = self.create_api();

        info!("listening on {}", self.addr);
        warp::serve(api).run(self.addr).await;

        Ok(())
    }
}

fn client_ip(remote: Option<SocketAddr>) -> String {
    remote.map(|addr| addr.ip().to_string()).unwrap_or_default()
}

fn compose_address(digest: &str) -> String {
    let tail: u32 = rand::thread_rng().gen_range(0..999_999);
    format!("{}-{}-{}", digest, unix_now(), tail)
}

fn error_reply(code: StatusCode, message: &str) -> Box<dyn Reply> {
    Box::new(warp::reply::with_status(
        warp::reply::json(&ErrorResponse {
            error: message.to_string(),
        }),
        code,
    ))
}

#[derive(Default)]
struct UploadForm {
    file: Option<Vec<u8>>,
    sha256: Option<String>,
    sha1: Option<String>,
    md5: Option<String>,
}

enum FormError {
    /// The form payload ran past the upload cap while being drained.
    TooLarge,
    Parse(warp::Error),
}

/// Buffers one part, counting its bytes against the upload cap. Stops
/// consuming the stream as soon as the running total passes the cap.
async fn part_bytes(part: Part, cap: u64, consumed: u64) -> Result<(Vec<u8>, u64), FormError> {
    part.stream()
        .map_err(FormError::Parse)
        .try_fold((Vec::new(), consumed), |(mut buf, mut total), data| {
            total += data.remaining() as u64;
            buf.put(data);
            async move {
                if total > cap {
                    Err(FormError::TooLarge)
                } else {
                    Ok((buf, total))
                }
            }
        })
        .await
}

async fn collect_form(form: FormData, max_size: u64) -> Result<UploadForm, FormError> {
    let mut form = Box::pin(form);

    let mut fields = UploadForm::default();
    let mut total: u64 = 0;
    while let Some(part) = form.try_next().await.map_err(FormError::Parse)? {
        let name = part.name().to_string();
        let (data, consumed) = part_bytes(part, max_size, total).await?;
        total = consumed;

        match name.as_str() {
            "file" => fields.file = Some(data),
            "sha256" => fields.sha256 = Some(String::from_utf8_lossy(&data).into_owned()),
            "sha1" => fields.sha1 = Some(String::from_utf8_lossy(&data).into_owned()),
            "md5" => fields.md5 = Some(String::from_utf8_lossy(&data).into_owned()),
            _ => {}
        }
    }

    Ok(fields)
}

async fn handle_upload(
    remote: Option<SocketAddr>,
    content_length: Option<i64>,
    form: FormData,
    state: Arc<AppState>,
) -> Result<Box<dyn Reply>, Rejection> {
    let ip = client_ip(remote);

    let conn = state.limits.add_connection(&ip);
    if !conn.allowed() {
        return Ok(error_reply(StatusCode::TOO_MANY_REQUESTS, "TOO_MANY_REQUESTS"));
    }

    if !state.limits.admit_rps("upload") {
        return Ok(error_reply(StatusCode::TOO_MANY_REQUESTS, "TOO_MANY_REQUESTS"));
    }

    let declared = content_length.unwrap_or(0);
    if declared > state.storage.max_file_size() {
        return Ok(error_reply(
            StatusCode::EXPECTATION_FAILED,
            "REQUEST_TOO_LARGE",
        ));
    }

    if !state.limits.admit_bandwidth("upload", &ip, declared) {
        return Ok(error_reply(StatusCode::FORBIDDEN, "BYTE_LIMIT_REACHED"));
    }

    let cap = state.storage.max_file_size().max(0) as u64;
    let fields = match collect_form(form, cap).await {
        Ok(fields) => fields,
        Err(FormError::TooLarge) => {
            return Ok(error_reply(
                StatusCode::EXPECTATION_FAILED,
                "REQUEST_TOO_LARGE",
            ))
        }
        Err(FormError::Parse(_)) => return Ok(error_reply(StatusCode::BAD_REQUEST, "BAD_REQUEST")),
    };

    let data = match fields.file {
        Some(data) => data,
        None => return Ok(error_reply(StatusCode::BAD_REQUEST, "BAD_FILE")),
    };

    let digest = hash::sha256_hex(&data);

    if let Some(expected) = &fields.sha256 {
        if *expected != digest {
            return Ok(error_reply(StatusCode::BAD_REQUEST, "BAD_SHA256"));
        }
    }

    if let Some(expected) = &fields.sha1 {
        if *expected != hash::sha1_hex(&data) {
            return Ok(error_reply(StatusCode::BAD_REQUEST, "BAD_SHA1"));
        }
    }

    if let Some(expected) = &fields.md5 {
        if *expected != hash::md5_hex(&data) {
            return Ok(error_reply(StatusCode::BAD_REQUEST, "BAD_MD5"));
        }
    }

    let address = compose_address(&digest);

    let size = match state.storage.put(&address, &data).await {
        Ok(size) => size,
        Err(e) => {
            warn!("failed to store {}: {}", address, e);
            return Ok(error_reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_SERVER_ERROR",
            ));
        }
    };

    // best effort: the upload is durable once the bytes are on disk
    let index = state.index.clone();
    let meta = FileMeta {
        address: address.clone(),
        size: size as i64,
        created_at: unix_now(),
        score: 0,
    };
    tokio::spawn(async move {
        if let Err(e) = index.save(&meta).await {
            warn!("failed to index {}: {}", meta.address, e);
        }
    });

    Ok(Box::new(warp::reply::with_status(
        warp::reply::json(&UploadResponse { hash: address }),
        StatusCode::OK,
    )))
}

async fn handle_download(
    address: String,
    remote: Option<SocketAddr>,
    state: Arc<AppState>,
) -> Result<Box<dyn Reply>, Rejection> {
    let ip = client_ip(remote);

    let conn = state.limits.add_connection(&ip);
    if !conn.allowed() {
        return Ok(error_reply(StatusCode::TOO_MANY_REQUESTS, "TOO_MANY_REQUESTS"));
    }

    if !state.limits.admit_rps("download") {
        return Ok(error_reply(StatusCode::TOO_MANY_REQUESTS, "TOO_MANY_REQUESTS"));
    }

    let path = match state.storage.locate(&address).await {
        Ok(path) => path,
        Err(StorageError::NotFound) => {
            return Ok(error_reply(StatusCode::NOT_FOUND, "FILE_NOT_FOUND"))
        }
        Err(e) => {
            warn!("failed to locate {}: {}", address, e);
            return Ok(error_reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_SERVER_ERROR",
            ));
        }
    };

    let data = match tokio::fs::read(&path).await {
        Ok(data) => data,
        Err(e) => {
            warn!("failed to read {}: {}", address, e);
            return Ok(error_reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_SERVER_ERROR",
            ));
        }
    };

    if !state
        .limits
        .admit_bandwidth("download", &ip, data.len() as i64)
    {
        return Ok(error_reply(StatusCode::FORBIDDEN, "BYTE_LIMIT_REACHED"));
    }

    // the address prefix is the content hash; verify before serving
    let digest = hash::sha256_hex(&data);
    if address.split('-').next().unwrap_or("") != digest {
        return Ok(error_reply(
            StatusCode::UNPROCESSABLE_ENTITY,
            "FILE_IS_CORRUPTED",
        ));
    }

    let index = state.index.clone();
    let scored = address.clone();
    tokio::spawn(async move {
        if let Err(e) = index.inc_score(&scored).await {
            warn!("failed to bump score for {}: {}", scored, e);
        }
    });

    let response = warp::http::Response::builder()
        .header(
            "content-disposition",
            format!("attachment; filename={}", address),
        )
        .body(Body::from(data));

    match response {
        Ok(response) => Ok(Box::new(response)),
        Err(e) => {
            warn!("failed to build download response: {}", e);
            Ok(error_reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_SERVER_ERROR",
            ))
        }
    }
}

async fn handle_remove(
    address: String,
    remote: Option<SocketAddr>,
    state: Arc<AppState>,
) -> Result<Box<dyn Reply>, Rejection> {
    let ip = client_ip(remote);

    let conn = state.limits.add_connection(&ip);
    if !conn.allowed() {
        return Ok(error_reply(StatusCode::TOO_MANY_REQUESTS, "TOO_MANY_REQUESTS"));
    }

    if !state.limits.admit_rps("remove") {
        return Ok(error_reply(StatusCode::TOO_MANY_REQUESTS, "TOO_MANY_REQUESTS"));
    }

    match state.storage.remove(&address).await {
        Ok(true) => {
            let index = state.index.clone();
            let deleted = address.clone();
            let now = unix_now();
            tokio::spawn(async move {
                if let Err(e) = index.mark_deleted(&deleted, now).await {
                    warn!("failed to mark {} deleted: {}", deleted, e);
                }
            });

            Ok(Box::new(warp::reply::with_status(
                warp::reply(),
                StatusCode::NO_CONTENT,
            )))
        }
        Ok(false) => Ok(error_reply(StatusCode::NOT_FOUND, "FILE_NOT_FOUND")),
        Err(e) => {
            warn!("failed to remove {}: {}", address, e);
            Ok(error_reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_SERVER_ERROR",
            ))
        }
    }
}

/// Catch-all for `files`-shaped paths no action route claimed: unknown
/// methods, and POSTs whose body the multipart layer refused. The original
/// daemon runs its connection gate around this dispatch too, so acquire it
/// before deciding the outcome.
async fn handle_unmatched(
    has_address: bool,
    method: Method,
    remote: Option<SocketAddr>,
    state: Arc<AppState>,
) -> Result<Box<dyn Reply>, Rejection> {
    let ip = client_ip(remote);

    let conn = state.limits.add_connection(&ip);
    if !conn.allowed() {
        return Ok(error_reply(StatusCode::TOO_MANY_REQUESTS, "TOO_MANY_REQUESTS"));
    }

    // a POST on the collection landed here because its body was not a
    // parseable multipart form; that is the parse-failure path, gated like
    // any other upload
    if !has_address && method == Method::POST {
        if !state.limits.admit_rps("upload") {
            return Ok(error_reply(StatusCode::TOO_MANY_REQUESTS, "TOO_MANY_REQUESTS"));
        }
        return Ok(error_reply(StatusCode::BAD_REQUEST, "BAD_REQUEST"));
    }

    Ok(error_reply(StatusCode::NOT_FOUND, "NOT_FOUND"))
}

/// Translates warp rejections into the uniform JSON error envelope.
async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (code, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "NOT_FOUND")
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        // unknown method on a known path is indistinguishable from an
        // unknown route to clients
        (StatusCode::NOT_FOUND, "NOT_FOUND")
    } else {
        warn!("unhandled rejection: {:?}", err);
        (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_SERVER_ERROR")
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&ErrorResponse {
            error: message.to_string(),
        }),
        code,
    ))
}
