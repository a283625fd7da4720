//! Dummy npm registry for integration tests.
//!
//! An axum server on an ephemeral port. Every request is recorded; requests
//! that are not plain `GET`s with an empty body, or that carry
//! `npm-auth-type`, are answered with 400 and recorded as violations.
//! Without a handler the server answers `418 Tea Break~`.

#![allow(dead_code)]

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use fastpkg_core::pkg::npmrc::load_npmrc_files;
use fastpkg_core::pkg::registry::ACCEPT_MANIFEST;
use fastpkg_core::pkg::{Algorithm, Integrity};
use fastpkg_core::InstallConfig;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// A request as seen by a handler.
#[derive(Debug, Clone)]
pub struct RegistryRequest {
    /// Full URL, e.g. `http://127.0.0.1:1234/foo`.
    pub url: String,
    /// Raw path without the leading slash, e.g. `@scope%2Fpkg`.
    pub path: String,
    pub headers: HeaderMap,
}

impl RegistryRequest {
    pub fn accept(&self) -> Option<&str> {
        self.headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
    }

    pub fn authorization(&self) -> Option<&str> {
        self.headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
    }

    pub fn is_tarball(&self) -> bool {
        self.path.ends_with(".tgz")
    }
}

/// A canned answer.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn status(status: StatusCode, body: &str) -> Self {
        Self {
            status,
            body: body.as_bytes().to_vec(),
        }
    }

    pub fn json(value: &Value) -> Self {
        Self {
            status: StatusCode::OK,
            body: serde_json::to_vec(value).unwrap(),
        }
    }

    pub fn bytes(body: Vec<u8>) -> Self {
        Self {
            status: StatusCode::OK,
            body,
        }
    }

    pub fn tea_break() -> Self {
        Self::status(StatusCode::IM_A_TEAPOT, "Tea Break~")
    }
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        (self.status, self.body).into_response()
    }
}

pub type Handler = Arc<dyn Fn(&RegistryRequest) -> Reply + Send + Sync>;

struct Inner {
    root_url: String,
    handler: Mutex<Handler>,
    urls: Mutex<Vec<String>>,
    violations: Mutex<Vec<String>>,
    tarballs: Mutex<HashMap<String, Vec<u8>>>,
    tarball_delay: Mutex<Option<Duration>>,
    requested: AtomicUsize,
}

/// Handle to a running dummy registry.
#[derive(Clone)]
pub struct DummyRegistry {
    inner: Arc<Inner>,
}

impl DummyRegistry {
    /// Start a registry on `127.0.0.1:0`.
    pub async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let inner = Arc::new(Inner {
            root_url: format!("http://127.0.0.1:{port}"),
            handler: Mutex::new(Arc::new(|_: &RegistryRequest| Reply::tea_break())),
            urls: Mutex::new(Vec::new()),
            violations: Mutex::new(Vec::new()),
            tarballs: Mutex::new(HashMap::new()),
            tarball_delay: Mutex::new(None),
            requested: AtomicUsize::new(0),
        });

        let app = Router::new().fallback(serve).with_state(Arc::clone(&inner));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { inner }
    }

    /// Base URL without a trailing slash.
    pub fn root_url(&self) -> &str {
        &self.inner.root_url
    }

    /// Registry URL as written into configuration.
    pub fn registry_url(&self) -> String {
        format!("{}/", self.inner.root_url)
    }

    pub fn set_handler(&self, handler: Handler) {
        *self.inner.handler.lock().unwrap() = handler;
    }

    /// Install a closure as the handler.
    pub fn respond_with(&self, f: impl Fn(&RegistryRequest) -> Reply + Send + Sync + 'static) {
        self.set_handler(Arc::new(f));
    }

    pub fn reset_handler(&self) {
        self.respond_with(|_| Reply::tea_break());
    }

    /// Serve `bytes` for `<root>/<file_name>`.
    pub fn add_tarball(&self, file_name: &str, bytes: Vec<u8>) {
        self.inner
            .tarballs
            .lock()
            .unwrap()
            .insert(file_name.to_string(), bytes);
    }

    pub fn tarball(&self, file_name: &str) -> Option<Vec<u8>> {
        self.inner.tarballs.lock().unwrap().get(file_name).cloned()
    }

    /// Hold every tarball answer for `delay`.
    pub fn set_tarball_delay(&self, delay: Duration) {
        *self.inner.tarball_delay.lock().unwrap() = Some(delay);
    }

    /// Number of requests received.
    pub fn requested(&self) -> usize {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Every requested URL, in arrival order.
    pub fn urls(&self) -> Vec<String> {
        self.inner.urls.lock().unwrap().clone()
    }

    /// Requested URLs ending in `.tgz`.
    pub fn tarball_urls(&self) -> Vec<String> {
        self.urls()
            .into_iter()
            .filter(|u| u.ends_with(".tgz"))
            .collect()
    }

    pub fn clear_urls(&self) {
        self.inner.urls.lock().unwrap().clear();
        self.inner.requested.store(0, Ordering::SeqCst);
    }

    /// Panic if any request broke the registry contract.
    pub fn assert_clean(&self) {
        let violations = self.inner.violations.lock().unwrap();
        assert!(violations.is_empty(), "registry contract violations: {violations:?}");
    }
}

async fn serve(
    State(inner): State<Arc<Inner>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    inner.requested.fetch_add(1, Ordering::SeqCst);
    let url = format!("{}{}", inner.root_url, uri.path());
    inner.urls.lock().unwrap().push(url.clone());

    let mut problems = Vec::new();
    if method != Method::GET {
        problems.push(format!("{method} {url}: only GET is allowed"));
    }
    if headers.contains_key("npm-auth-type") {
        problems.push(format!("{url}: npm-auth-type must not be sent"));
    }
    if !body.is_empty() {
        problems.push(format!("{url}: request body must be empty"));
    }
    if !problems.is_empty() {
        let message = problems.join("; ");
        inner.violations.lock().unwrap().extend(problems);
        return (StatusCode::BAD_REQUEST, message).into_response();
    }

    let request = RegistryRequest {
        url,
        path: uri.path().trim_start_matches('/').to_string(),
        headers,
    };

    if request.is_tarball() {
        let delay = *inner.tarball_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    let handler = Arc::clone(&inner.handler.lock().unwrap());
    (*handler)(&request).into_response()
}

/// Handler serving `info` as the manifest of every requested name.
///
/// `info` maps versions to extra descriptor fields (`dependencies`, `bin`,
/// `dist`, ...); an `as` field renames the tarball, and a `latest` key sets the
/// dist-tag. Tarballs registered with [`DummyRegistry::add_tarball`] are
/// served as is; any other `<name>-<version>.tgz` gets a minimal package.
pub fn dummy_registry(registry: &DummyRegistry, info: Value) -> Handler {
    dummy_packages_with(registry, move |_| Some(info.clone()))
}

/// Handler serving one manifest per package name; unknown names get 404.
pub fn dummy_packages(registry: &DummyRegistry, packages: Value) -> Handler {
    dummy_packages_with(registry, move |name| {
        let decoded = name.replace("%2F", "/").replace("%2f", "/");
        packages.get(decoded.as_str()).cloned()
    })
}

fn dummy_packages_with(
    registry: &DummyRegistry,
    lookup: impl Fn(&str) -> Option<Value> + Send + Sync + 'static,
) -> Handler {
    let registry = registry.clone();
    Arc::new(move |request: &RegistryRequest| {
        if request.is_tarball() {
            return serve_tarball(&registry, &request.path);
        }
        if request.accept() != Some(ACCEPT_MANIFEST) {
            return Reply::status(
                StatusCode::BAD_REQUEST,
                &format!("unexpected accept header: {:?}", request.accept()),
            );
        }
        match lookup(&request.path) {
            Some(info) => Reply::json(&manifest_for(&request.url, &request.path, &info)),
            None => Reply::status(StatusCode::NOT_FOUND, "{\"error\":\"Not found\"}"),
        }
    })
}

fn serve_tarball(registry: &DummyRegistry, file_name: &str) -> Reply {
    let file_name = file_name.to_lowercase();
    if let Some(bytes) = registry.tarball(&file_name) {
        return Reply::bytes(bytes);
    }
    match split_tarball_name(&file_name) {
        Some((name, version)) => Reply::bytes(package_tarball(&name, &version, &[])),
        None => Reply::status(StatusCode::NOT_FOUND, "no such tarball"),
    }
}

/// `foo-1.0.0-beta.1.tgz` into `("foo", "1.0.0-beta.1")`.
fn split_tarball_name(file_name: &str) -> Option<(String, String)> {
    let stem = file_name.strip_suffix(".tgz")?;
    stem.match_indices('-').find_map(|(i, _)| {
        let version = &stem[i + 1..];
        semver::Version::parse(version).ok().map(|_| {
            let name = stem[..i].replace("%2f", "/");
            (name, version.to_string())
        })
    })
}

fn manifest_for(url: &str, raw_name: &str, info: &Value) -> Value {
    let name = raw_name.replace("%2F", "/").replace("%2f", "/");
    let mut versions = Map::new();
    if let Some(entries) = info.as_object() {
        for (version, extra) in entries {
            if !version.starts_with(|c: char| c.is_ascii_digit()) {
                continue;
            }
            let tarball_version = extra.get("as").and_then(Value::as_str).unwrap_or(version);
            let mut dist = json!({ "tarball": format!("{url}-{tarball_version}.tgz") });
            if let Some(extra_dist) = extra.get("dist").and_then(Value::as_object) {
                for (k, v) in extra_dist {
                    dist[k] = v.clone();
                }
            }

            let mut descriptor = json!({ "name": name, "version": version });
            if let Some(extra) = extra.as_object() {
                for (k, v) in extra {
                    if k != "as" && k != "dist" {
                        descriptor[k] = v.clone();
                    }
                }
            }
            descriptor["dist"] = dist;
            versions.insert(version.clone(), descriptor);
        }
    }

    let mut manifest = json!({ "name": name, "versions": versions, "dist-tags": {} });
    if let Some(latest) = info.get("latest") {
        manifest["dist-tags"]["latest"] = latest.clone();
    }
    manifest
}

/// Gzipped tar of `files`, each given as `(path, content)`.
pub fn make_tarball(files: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *content).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Tarball with `package/package.json` plus `extra` files under `package/`.
pub fn package_tarball(name: &str, version: &str, extra: &[(&str, &[u8])]) -> Vec<u8> {
    let package_json = serde_json::to_vec(&json!({ "name": name, "version": version })).unwrap();
    let mut files: Vec<(String, &[u8])> = vec![("package/package.json".to_string(), package_json.as_slice())];
    for (path, content) in extra {
        files.push((format!("package/{path}"), content));
    }
    let borrowed: Vec<(&str, &[u8])> = files.iter().map(|(p, c)| (p.as_str(), *c)).collect();
    make_tarball(&borrowed)
}

/// SRI string (sha512) of `bytes`.
pub fn sri(bytes: &[u8]) -> String {
    Integrity::compute(Algorithm::Sha512, bytes).to_string()
}

/// A scratch project whose `.npmrc` points at the dummy registry with the
/// cache disabled.
pub struct TestProject {
    dir: TempDir,
}

impl TestProject {
    pub fn new(registry: &DummyRegistry) -> Self {
        let dir = tempfile::Builder::new()
            .prefix("fastpkg-install.test")
            .tempdir()
            .unwrap();
        std::fs::write(
            dir.path().join(".npmrc"),
            format!("registry={}\ncache=false\n", registry.registry_url()),
        )
        .unwrap();
        Self { dir }
    }

    pub fn package_dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn node_modules(&self) -> PathBuf {
        self.dir.path().join("node_modules")
    }

    pub fn write_package_json(&self, value: &Value) {
        std::fs::write(
            self.dir.path().join("package.json"),
            serde_json::to_string_pretty(value).unwrap(),
        )
        .unwrap();
    }

    /// Configuration from the project's `.npmrc`, ignoring the process environment.
    pub fn config(&self) -> InstallConfig {
        InstallConfig::from_sources(load_npmrc_files(self.package_dir()), |_| None).unwrap()
    }
}

/// Directory entries of `path`, sorted.
pub fn readdir_sorted(path: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(path)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
