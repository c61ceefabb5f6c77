//! The HTTP surface.
//!
//! One wildcard route owns the whole address grammar:
//! `/<account|@account>/<repo>?/<branch>?/<endpoint-or-path>`. Missing
//! repo and branch segments fall back to the account's default repo
//! and the repo's default public branch. Endpoints under the resolved
//! prefix serve authentication, commit history, record listings,
//! fileset archives, search, and plain file fetches; everything is
//! backed by a cached pipeline artifact and stamped with the
//! `<commit>-<group>` etag.

mod listener;

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::Response;
use axum::Router;
use bytes::Bytes;
use percent_encoding::percent_decode_str;
use tokio::io::AsyncReadExt;

use crate::acm::{AcmError, RequestAuthInput};
use crate::app::App;
use crate::context::RequestContext;
use crate::fileset::FileRecord;
use crate::glob::ComplementSpec;
use crate::negotiator::NegotiationHeaders;
use crate::pipeline::{Artifact, PipelineError};
use crate::search::SearchMode;
use crate::util::fingerprint_parts;

/// Commits returned by the commits endpoint.
const COMMITS_LIMIT: usize = 50;

static RESPONSE_SEQ: AtomicU64 = AtomicU64::new(0);

// =============================================================================
// Errors
// =============================================================================

/// An error already mapped to its HTTP shape.
#[derive(Debug)]
pub struct HttpError {
    pub status: StatusCode,
    pub realm: Option<String>,
    pub message: String,
}

impl HttpError {
    fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            realm: None,
            message: "not found".to_string(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            realm: None,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            realm: None,
            message: message.into(),
        }
    }
}

impl From<AcmError> for HttpError {
    fn from(err: AcmError) -> Self {
        match err {
            AcmError::AuthRequired { realm } | AcmError::AuthFailed { realm } => Self {
                status: StatusCode::UNAUTHORIZED,
                realm: Some(realm),
                message: "authentication required".to_string(),
            },
            AcmError::BadVisibleSet(message) => Self::bad_request(message),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<PipelineError> for HttpError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::InvalidArgument(message) => Self::bad_request(message),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<crate::negotiator::NegotiatorError> for HttpError {
    fn from(err: crate::negotiator::NegotiatorError) -> Self {
        match err {
            crate::negotiator::NegotiatorError::NoBranch(_) => Self::not_found(),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<crate::search::SearchError> for HttpError {
    fn from(err: crate::search::SearchError) -> Self {
        Self::internal(err.to_string())
    }
}

impl From<std::io::Error> for HttpError {
    fn from(err: std::io::Error) -> Self {
        Self::internal(err.to_string())
    }
}

type Result<T> = std::result::Result<T, HttpError>;

// =============================================================================
// Entry
// =============================================================================

/// The application router: a single fallback route owning the address
/// grammar.
pub fn router(app: Arc<App>) -> Router {
    Router::new().fallback(handle).with_state(app)
}

/// Bind the HTTP server and the post-receive hook listener.
pub async fn serve(app: Arc<App>) -> std::io::Result<()> {
    {
        let builder = Arc::clone(&app.builder);
        let host = app.config.updates_listener.host.clone();
        let port = app.config.updates_listener.port;
        tokio::spawn(async move {
            if let Err(err) = listener::run(&host, port, builder).await {
                log::warn!("updates listener exited: {err}");
            }
        });
    }

    let addr = format!("{}:{}", app.config.server.host, app.config.server.port);
    let tcp = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("serving content on {addr}");
    axum::serve(tcp, router(app)).await
}

async fn handle(
    State(app): State<Arc<App>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match dispatch(&app, &method, &uri, &headers, &body).await {
        Ok(response) => response,
        Err(err) => error_response(&app, &headers, err).await,
    }
}

// =============================================================================
// Request parsing
// =============================================================================

fn parse_query(uri: &Uri) -> Vec<(String, String)> {
    let decode = |s: &str| {
        percent_decode_str(&s.replace('+', " "))
            .decode_utf8_lossy()
            .into_owned()
    };
    uri.query()
        .unwrap_or("")
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (decode(key), decode(value)),
            None => (decode(pair), String::new()),
        })
        .collect()
}

fn query_get<'a>(query: &'a [(String, String)], name: &str) -> Option<&'a str> {
    query
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn negotiation_headers(headers: &HeaderMap) -> NegotiationHeaders {
    NegotiationHeaders {
        accept: header_str(headers, "accept").map(str::to_string),
        accept_language: header_str(headers, "accept-language").map(str::to_string),
        accept_charset: header_str(headers, "accept-charset").map(str::to_string),
        accept_encoding: header_str(headers, "accept-encoding").map(str::to_string),
    }
}

/// Assemble the ACM inputs from headers, query, and an optional JSON
/// body.
fn auth_input(
    headers: &HeaderMap,
    query: &[(String, String)],
    body: Option<&serde_json::Value>,
) -> RequestAuthInput {
    let filter = {
        let includes = query_get(query, "filter[includes]");
        let excludes = query_get(query, "filter[excludes]");
        let plain = query_get(query, "filter");
        if includes.is_some() || excludes.is_some() {
            Some(ComplementSpec {
                includes: split_patterns(includes.unwrap_or("")),
                excludes: split_patterns(excludes.unwrap_or("")),
            })
        } else {
            plain.map(|patterns| ComplementSpec {
                includes: split_patterns(patterns),
                excludes: vec![],
            })
        }
    };

    RequestAuthInput {
        authorization: header_str(headers, "authorization").map(str::to_string),
        accept_language: header_str(headers, "accept-language").map(str::to_string),
        filter,
        cvs: body.and_then(|b| b.get("cvs")).cloned(),
    }
}

fn split_patterns(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Resolve the address grammar into a request context plus the
/// trailing segments.
fn resolve_address(
    app: &App,
    headers: &HeaderMap,
    segments: &[String],
) -> Result<RequestContext> {
    let first = segments.first().ok_or_else(HttpError::not_found)?;
    let account_only = first.starts_with('@');
    let account = first.trim_start_matches('@').to_string();
    if !app.branches.is_account_name(&account) {
        return Err(HttpError::not_found());
    }

    let mut consumed = 1;
    let repo = match segments.get(consumed) {
        Some(seg) if app.branches.is_repo_name(&account, seg) => {
            consumed += 1;
            seg.clone()
        }
        _ => app
            .branches
            .default_repo(&account)
            .ok_or_else(HttpError::not_found)?,
    };

    let branch = match segments.get(consumed) {
        Some(seg) if app.branches.is_public_branch(&account, &repo, seg) => {
            consumed += 1;
            seg.clone()
        }
        _ => app
            .branches
            .default_public_branch(&account, &repo)
            .ok_or_else(HttpError::not_found)?,
    };

    let mount = app.config.server.mount_path.trim_end_matches('/');
    let base_path = if account_only {
        format!("{mount}/{first}")
    } else {
        format!("{mount}/{account}/{repo}")
    };
    let hostname = header_str(headers, "host")
        .map(|h| h.split(':').next().unwrap_or(h).to_string())
        .unwrap_or_else(|| "localhost".to_string());

    let mut ctx = RequestContext::new(
        &account,
        &repo,
        &branch,
        app.branches.repo_path(&account, &repo),
        &base_path,
        &hostname,
    );
    ctx.trailing = segments[consumed..].to_vec();
    Ok(ctx)
}

// =============================================================================
// Dispatch
// =============================================================================

async fn dispatch(
    app: &Arc<App>,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Response> {
    let mount = app.config.server.mount_path.trim_end_matches('/');
    let path = uri.path();
    let path = path.strip_prefix(mount).unwrap_or(path);
    let segments: Vec<String> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| percent_decode_str(s).decode_utf8_lossy().into_owned())
        .collect();

    let query = parse_query(uri);
    let mut ctx = resolve_address(app, headers, &segments)?;

    let body_json: Option<serde_json::Value> = if body.is_empty() {
        None
    } else {
        serde_json::from_slice(body).ok()
    };

    let endpoint = ctx.trailing.first().map(String::as_str).unwrap_or("");
    match endpoint {
        "authenticate.api" if method == Method::POST => {
            ctx.secure = true;
            let input = auth_input(headers, &query, body_json.as_ref());
            let auth = app.settings.build_context(&ctx, &input).await?;
            let user = serde_json::to_value(&auth.user_info)
                .map_err(|e| HttpError::internal(e.to_string()))?;
            json_response(StatusCode::OK, user)
        }
        "commits.api" if method == Method::GET => {
            authenticate(app, &mut ctx, headers, &query, body_json.as_ref()).await?;
            commits_endpoint(app, &ctx, headers).await
        }
        "updates.api"
            if method == Method::GET || method == Method::POST || method == Method::HEAD =>
        {
            authenticate(app, &mut ctx, headers, &query, body_json.as_ref()).await?;
            updates_endpoint(app, &ctx, method, headers, &query, body_json.as_ref()).await
        }
        "filesets.api" if method == Method::GET || method == Method::POST => {
            authenticate(app, &mut ctx, headers, &query, body_json.as_ref()).await?;
            filesets_endpoint(app, &ctx, headers, &query).await
        }
        "search.api" if method == Method::GET => {
            authenticate(app, &mut ctx, headers, &query, body_json.as_ref()).await?;
            search_endpoint(app, &ctx, headers, &query).await
        }
        "robots.txt" if method == Method::GET => text_response("User-agent: *\nDisallow:\n"),
        _ if method == Method::GET || method == Method::HEAD => {
            authenticate(app, &mut ctx, headers, &query, body_json.as_ref()).await?;
            file_endpoint(app, &ctx, method, headers, &query).await
        }
        _ => Err(HttpError::not_found()),
    }
}

async fn authenticate(
    app: &Arc<App>,
    ctx: &mut RequestContext,
    headers: &HeaderMap,
    query: &[(String, String)],
    body: Option<&serde_json::Value>,
) -> Result<()> {
    let input = auth_input(headers, query, body);
    let auth = app.settings.build_context(ctx, &input).await?;
    ctx.auth = Some(auth);
    Ok(())
}

// =============================================================================
// Endpoints
// =============================================================================

async fn commits_endpoint(
    app: &Arc<App>,
    ctx: &RequestContext,
    headers: &HeaderMap,
) -> Result<Response> {
    let commits = app
        .filedb
        .list_commits(ctx, COMMITS_LIMIT)
        .await?
        .ok_or_else(HttpError::not_found)?;

    // Newest first, so the first entry is the branch head.
    let head = commits.first().map(|c| c.id.as_str()).unwrap_or("00000000");
    let etag = format!("\"{head}-{}\"", ctx.group());
    let cache_control = &app.config.server.cache_control;
    if header_str(headers, "if-none-match") == Some(etag.as_str()) {
        return Ok(Response::builder()
            .status(StatusCode::NOT_MODIFIED)
            .header(header::ETAG, &etag)
            .header(header::CACHE_CONTROL, cache_control)
            .body(Body::empty())
            .expect("valid HTTP response"));
    }

    let rows: Vec<serde_json::Value> = commits
        .into_iter()
        .map(|c| serde_json::json!({"commit": c.id, "message": c.subject}))
        .collect();
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::ETAG, &etag)
        .header(header::CACHE_CONTROL, cache_control)
        .header(
            header::CONTENT_LOCATION,
            format!("{}/commits.api", ctx.base_path),
        )
        .body(Body::from(serde_json::Value::Array(rows).to_string()))
        .expect("valid HTTP response"))
}

async fn updates_endpoint(
    app: &Arc<App>,
    ctx: &RequestContext,
    method: &Method,
    headers: &HeaderMap,
    query: &[(String, String)],
    body: Option<&serde_json::Value>,
) -> Result<Response> {
    let since = query_get(query, "since")
        .map(str::to_string)
        .or_else(|| {
            body.and_then(|b| b.get("since"))
                .and_then(|s| s.as_str())
                .map(str::to_string)
        });

    // A stale client group means its whole view is suspect.
    if let Some(submitted) = query_get(query, "group") {
        if submitted != ctx.group() {
            return Ok(Response::builder()
                .status(StatusCode::RESET_CONTENT)
                .body(Body::empty())
                .unwrap());
        }
    }

    let artifact = match since.as_deref() {
        Some(since) => app.filedb.list_updates_since(ctx, since, None).await?,
        None => app.filedb.list_all_files(ctx, None).await?,
    }
    .ok_or_else(HttpError::not_found)?;

    app.sync_set.mark(&ctx.key, ctx.group());
    artifact_response(
        app,
        ctx,
        method,
        headers,
        artifact,
        "application/x-ndjson",
        &format!("{}/updates.api", ctx.base_path),
    )
    .await
}

async fn filesets_endpoint(
    app: &Arc<App>,
    ctx: &RequestContext,
    headers: &HeaderMap,
    query: &[(String, String)],
) -> Result<Response> {
    let category = ctx
        .trailing
        .get(1)
        .ok_or_else(|| HttpError::bad_request("missing fileset category"))?
        .clone();
    let mode = ctx
        .trailing
        .get(2)
        .map(String::as_str)
        .ok_or_else(|| HttpError::bad_request("missing fileset mode"))?;
    let since = query_get(query, "since");

    let (artifact, content_type) = match mode {
        "list" => (
            app.filedb.get_fileset_records(ctx, &category, since).await?,
            "application/x-ndjson",
        ),
        "contents" => (
            app.filedb.get_fileset_contents(ctx, &category, since).await?,
            "application/zip",
        ),
        other => {
            return Err(HttpError::bad_request(format!(
                "bad fileset mode '{other}'"
            )));
        }
    };
    let artifact = artifact.ok_or_else(HttpError::not_found)?;
    let location = format!("{}/filesets.api/{category}/{mode}", ctx.base_path);
    artifact_response(app, ctx, &Method::GET, headers, artifact, content_type, &location).await
}

async fn search_endpoint(
    app: &Arc<App>,
    ctx: &RequestContext,
    headers: &HeaderMap,
    query: &[(String, String)],
) -> Result<Response> {
    let term = query_get(query, "s")
        .ok_or_else(|| HttpError::bad_request("missing search term"))?
        .to_string();
    let mode = SearchMode::parse(query_get(query, "m"));
    let path = query_get(query, "p").map(str::to_string);

    let auth = ctx.auth.clone().ok_or_else(|| HttpError::internal("no auth"))?;
    let etag = format!(
        "\"{}\"",
        fingerprint_parts([
            term.as_str(),
            mode.as_str(),
            path.as_deref().unwrap_or(""),
            ctx.group(),
        ])
    );
    if header_str(headers, "if-none-match") == Some(etag.as_str()) {
        return Ok(Response::builder()
            .status(StatusCode::NOT_MODIFIED)
            .header(header::ETAG, &etag)
            .body(Body::empty())
            .unwrap());
    }

    let artifact = app
        .search
        .query(&ctx.account, &ctx.repo, &ctx.branch, &term, mode, path.as_deref())
        .await?;
    let rows = artifact.rows().await?;
    let resources = app.negotiator.resources(ctx).await?;
    let neg_headers = negotiation_headers(headers);
    let user_groups = auth.user_info.groups.clone();

    // One named queue per response keeps record writes ordered and the
    // array framing intact.
    let queue_name = format!("response-{}", RESPONSE_SEQ.fetch_add(1, Ordering::Relaxed));
    let (tx, rx) = tokio::sync::mpsc::channel::<std::io::Result<Bytes>>(16);
    let queues = Arc::clone(&app.queues);

    tokio::spawn(async move {
        let send = |chunk: Bytes| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(Ok(chunk)).await;
            }
        };
        queues.run(&queue_name, || send(Bytes::from_static(b"["))).await;
        let mut first = true;
        for row in rows {
            if !auth.accessible.contains(&row.category) {
                continue;
            }
            let mut probe = FileRecord::published(&row.path, &row.category, "");
            probe.commit = None;
            if !auth.filter(&probe) {
                continue;
            }
            if !resources.is_preferred_path(&row.path, &neg_headers, &user_groups) {
                continue;
            }
            let mut chunk = if first { String::new() } else { ",".to_string() };
            first = false;
            match serde_json::to_string(&row) {
                Ok(json) => chunk.push_str(&json),
                Err(_) => continue,
            }
            queues.run(&queue_name, || send(Bytes::from(chunk))).await;
        }
        queues.run(&queue_name, || send(Bytes::from_static(b"]"))).await;
    });

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::ETAG, &etag)
        .header(header::CACHE_CONTROL, &app.config.server.cache_control)
        .body(Body::from_stream(ChannelStream { rx }))
        .expect("valid HTTP response"))
}

async fn file_endpoint(
    app: &Arc<App>,
    ctx: &RequestContext,
    method: &Method,
    headers: &HeaderMap,
    query: &[(String, String)],
) -> Result<Response> {
    let request_path = ctx.trailing_path();

    if query_get(query, "format") == Some("record") {
        let artifact = app
            .filedb
            .get_file_record(ctx, &request_path)
            .await?
            .ok_or_else(HttpError::not_found)?;
        let location = format!("{}/{request_path}", ctx.base_path);
        return artifact_response(
            app,
            ctx,
            method,
            headers,
            artifact,
            "application/json",
            &location,
        )
        .await;
    }

    let neg_headers = negotiation_headers(headers);
    let rep_path = app
        .negotiator
        .representation_path(ctx, &neg_headers, &request_path)
        .await?;
    let artifact = app
        .filedb
        .get_file_contents(ctx, &rep_path)
        .await?
        .ok_or_else(HttpError::not_found)?;

    let location = format!("{}/{rep_path}", ctx.base_path);

    // `@d` evaluates the trivial substitution template over text
    // responses. The common response policy still applies: conditional
    // requests short-circuit before any rendering.
    if query_get(query, "@d").is_some() && is_text(&artifact) {
        let etag = format!("\"{}\"", artifact.etag());
        let cache_control = artifact
            .cache_control
            .as_deref()
            .unwrap_or(&app.config.server.cache_control);
        if header_str(headers, "if-none-match") == Some(etag.as_str()) {
            return Ok(Response::builder()
                .status(StatusCode::NOT_MODIFIED)
                .header(header::ETAG, &etag)
                .header(header::CACHE_CONTROL, cache_control)
                .body(Body::empty())
                .expect("valid HTTP response"));
        }

        let text = artifact.read_to_string().await?;
        let rendered = substitute(ctx, &text);
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header(
                header::CONTENT_TYPE,
                artifact.mime_type.as_deref().unwrap_or("text/plain"),
            )
            .header(header::ETAG, &etag)
            .header(header::CACHE_CONTROL, cache_control)
            .header(header::CONTENT_LOCATION, &location)
            .body(Body::from(rendered))
            .expect("valid HTTP response"));
    }

    artifact_response(app, ctx, method, headers, artifact, "application/octet-stream", &location)
        .await
}

fn is_text(artifact: &Artifact) -> bool {
    artifact
        .mime_type
        .as_deref()
        .is_some_and(|mime| mime.starts_with("text/") || mime.ends_with("json"))
}

/// The trivial substitution hook: `{{account}}`, `{{repo}}`,
/// `{{branch}}`, `{{basePath}}`.
fn substitute(ctx: &RequestContext, text: &str) -> String {
    text.replace("{{account}}", &ctx.account)
        .replace("{{repo}}", &ctx.repo)
        .replace("{{branch}}", &ctx.branch)
        .replace("{{basePath}}", &ctx.base_path)
}

// =============================================================================
// Responses
// =============================================================================

fn json_response(status: StatusCode, value: serde_json::Value) -> Result<Response> {
    Ok(Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(value.to_string()))
        .expect("valid HTTP response"))
}

fn text_response(text: &'static str) -> Result<Response> {
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from(text))
        .expect("valid HTTP response"))
}

/// Serve a pipeline artifact with the common response policy: etag,
/// conditional 304, cache-control, content-location, streamed body.
async fn artifact_response(
    app: &Arc<App>,
    _ctx: &RequestContext,
    method: &Method,
    headers: &HeaderMap,
    artifact: Artifact,
    default_content_type: &str,
    location: &str,
) -> Result<Response> {
    let etag = format!("\"{}\"", artifact.etag());
    let cache_control = artifact
        .cache_control
        .clone()
        .unwrap_or_else(|| app.config.server.cache_control.clone());

    if header_str(headers, "if-none-match") == Some(etag.as_str()) {
        return Ok(Response::builder()
            .status(StatusCode::NOT_MODIFIED)
            .header(header::ETAG, &etag)
            .header(header::CACHE_CONTROL, &cache_control)
            .body(Body::empty())
            .unwrap());
    }

    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            artifact.mime_type.as_deref().unwrap_or(default_content_type),
        )
        .header(header::ETAG, &etag)
        .header(header::CACHE_CONTROL, &cache_control)
        .header(header::CONTENT_LOCATION, location);

    if method == Method::HEAD {
        return Ok(builder.body(Body::empty()).unwrap());
    }

    let file = artifact.open().await?;
    Ok(builder.body(file_body(file)).expect("valid HTTP response"))
}

/// Stream a file as a response body in bounded chunks.
fn file_body(file: tokio::fs::File) -> Body {
    let stream = futures::stream::unfold(file, |mut file| async move {
        let mut buf = vec![0u8; 64 * 1024];
        match file.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok::<Bytes, std::io::Error>(Bytes::from(buf)), file))
            }
            Err(err) => Some((Err(err), file)),
        }
    });
    Body::from_stream(stream)
}

/// Adapter from an mpsc receiver to a body stream.
struct ChannelStream {
    rx: tokio::sync::mpsc::Receiver<std::io::Result<Bytes>>,
}

impl futures::Stream for ChannelStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Render an error as its HTTP response, with the matching error page
/// when the client accepts HTML.
async fn error_response(app: &Arc<App>, headers: &HeaderMap, err: HttpError) -> Response {
    if err.status == StatusCode::INTERNAL_SERVER_ERROR {
        log::warn!("request failed: {}", err.message);
    }

    let mut builder = Response::builder().status(err.status);
    if let Some(realm) = &err.realm {
        builder = builder.header(
            header::WWW_AUTHENTICATE,
            format!("Basic realm=\"{realm}\""),
        );
    }

    let accepts_html = header_str(headers, "accept").is_some_and(|a| a.contains("text/html"));
    let body = if accepts_html {
        match error_page(app, err.status.as_u16()).await {
            Some(page) => {
                builder = builder.header(header::CONTENT_TYPE, "text/html");
                Body::from(page)
            }
            None => Body::empty(),
        }
    } else {
        Body::empty()
    };
    builder.body(body).unwrap()
}

/// `errors/<code>.html`, falling back to `errors/xxx.html`.
async fn error_page(app: &Arc<App>, code: u16) -> Option<String> {
    let dir = app.config.server.errors_dir.as_ref()?;
    for name in [format!("{code}.html"), "xxx.html".to_string()] {
        if let Ok(page) = tokio::fs::read_to_string(dir.join(name)).await {
            return Some(page);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_parsing_decodes_pairs() {
        let uri: Uri = "/x?s=hello+world&m=all&p=docs%2Fguides".parse().unwrap();
        let query = parse_query(&uri);
        assert_eq!(query_get(&query, "s"), Some("hello world"));
        assert_eq!(query_get(&query, "m"), Some("all"));
        assert_eq!(query_get(&query, "p"), Some("docs/guides"));
        assert_eq!(query_get(&query, "missing"), None);
    }

    #[test]
    fn flag_parameters_parse_without_values() {
        let uri: Uri = "/x?@d&format=record".parse().unwrap();
        let query = parse_query(&uri);
        assert_eq!(query_get(&query, "@d"), Some(""));
        assert_eq!(query_get(&query, "format"), Some("record"));
    }

    #[test]
    fn filter_params_become_complement_specs() {
        let headers = HeaderMap::new();
        let query = vec![
            ("filter[includes]".to_string(), "docs/*, img/*".to_string()),
            ("filter[excludes]".to_string(), "docs/wip/*".to_string()),
        ];
        let input = auth_input(&headers, &query, None);
        let spec = input.filter.unwrap();
        assert_eq!(spec.includes, vec!["docs/*", "img/*"]);
        assert_eq!(spec.excludes, vec!["docs/wip/*"]);

        let query = vec![("filter".to_string(), "*.html".to_string())];
        let input = auth_input(&headers, &query, None);
        assert_eq!(input.filter.unwrap().includes, vec!["*.html"]);
    }

    #[test]
    fn substitution_hook_replaces_context_tokens() {
        let ctx = RequestContext::new(
            "acc",
            "site",
            "master",
            std::path::PathBuf::from("/repos/acc/site.git"),
            "/acc/site",
            "cdn.example.com",
        );
        let out = substitute(&ctx, "at {{basePath}} on {{branch}}");
        assert_eq!(out, "at /acc/site on master");
    }
}
