//! Concurrent release downloads.
//!
//! Every file of a release is fetched on its own thread while holding an
//! unprivileged lease. Results come back over a channel in completion order;
//! the first failure is returned immediately and the remaining workers are
//! told to stop.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use sha2::{Digest, Sha256};
use url::Url;

use crate::catalog::ImageFile;
use crate::privilege::Privileges;
use uemu_error::{ProvisionError, Result};

const USER_AGENT: &str = concat!("uemu/", env!("CARGO_PKG_VERSION"));

pub(crate) fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|err| ProvisionError::configuration(format!("cannot build HTTP client: {}", err)))
}

/// Rewrite `path` so it is relative to `server`.
///
/// Catalog paths are normally server-relative already; absolute URLs are
/// accepted only when they point at the same server.
pub fn relative_to_server(path: &str, server: &str) -> Result<String> {
    let server = server.trim_end_matches('/');
    if let Some(rest) = path.strip_prefix(server) {
        return Ok(rest.to_string());
    }
    if path.contains("://") {
        return Err(ProvisionError::download(
            path,
            format!("file is not hosted on {}", server),
        ));
    }
    if path.starts_with('/') {
        Ok(path.to_string())
    } else {
        Ok(format!("/{}", path))
    }
}

/// Full URL of a server-relative path.
pub(crate) fn server_url(server: &str, path: &str) -> Result<Url> {
    let rel = relative_to_server(path, server)?;
    let joined = format!("{}{}", server.trim_end_matches('/'), rel);
    Url::parse(&joined).map_err(|err| ProvisionError::download(joined.clone(), err.to_string()))
}

/// Cache location of a server-relative path.
pub fn cache_path(cache_dir: &Path, rel: &str) -> PathBuf {
    cache_dir.join(rel.trim_start_matches('/'))
}

pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn cached_copy_matches(path: &Path, file: &ImageFile) -> bool {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() && meta.len() == file.size => sha256_file(path)
            .map(|sum| sum.eq_ignore_ascii_case(&file.checksum))
            .unwrap_or(false),
        _ => false,
    }
}

struct Fetch<'a> {
    client: &'a Client,
    server: &'a str,
    cache_dir: &'a Path,
    cancel: &'a AtomicBool,
}

impl Fetch<'_> {
    /// Stream `rel` into `dest` through a `.part` file.
    fn get(&self, rel: &str, dest: &Path) -> Result<()> {
        let url = server_url(self.server, rel)?;
        let fail = |message: String| ProvisionError::download(url.as_str(), message);

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut response = self
            .client
            .get(url.clone())
            .send()
            .and_then(|resp| resp.error_for_status())
            .map_err(|err| fail(err.to_string()))?;

        let mut part_name = dest.as_os_str().to_owned();
        part_name.push(".part");
        let part = PathBuf::from(part_name);
        let mut out = File::create(&part)?;
        let mut buffer = [0u8; 64 * 1024];
        loop {
            if self.cancel.load(Ordering::Relaxed) {
                let _ = fs::remove_file(&part);
                return Err(fail("cancelled".to_string()));
            }
            let read = response.read(&mut buffer).map_err(|err| fail(err.to_string()))?;
            if read == 0 {
                break;
            }
            out.write_all(&buffer[..read])?;
        }
        out.flush()?;
        drop(out);
        fs::rename(&part, dest)?;
        Ok(())
    }

    fn file(&self, file: &ImageFile) -> Result<PathBuf> {
        let rel = relative_to_server(&file.path, self.server)?;
        let dest = cache_path(self.cache_dir, &rel);

        if cached_copy_matches(&dest, file) {
            log::info!("using cached {}", dest.display());
        } else {
            log::info!("downloading {}{}", self.server, rel);
            self.get(&rel, &dest)?;
            let sum = sha256_file(&dest)?;
            if !sum.eq_ignore_ascii_case(&file.checksum) {
                let _ = fs::remove_file(&dest);
                return Err(ProvisionError::download(
                    format!("{}{}", self.server, rel),
                    format!("checksum mismatch: {} != {}", sum, file.checksum),
                ));
            }
        }

        if let Some(signature) = &file.signature {
            let sig_rel = relative_to_server(signature, self.server)?;
            let sig_dest = cache_path(self.cache_dir, &sig_rel);
            if !sig_dest.is_file() {
                self.get(&sig_rel, &sig_dest)?;
            }
        }
        Ok(dest)
    }
}

pub struct DownloadManager {
    server: String,
    cache_dir: PathBuf,
    client: Client,
    privileges: Arc<Privileges>,
}

impl DownloadManager {
    pub fn new(
        server: &str,
        cache_dir: impl Into<PathBuf>,
        timeout: Duration,
        privileges: Arc<Privileges>,
    ) -> Result<Self> {
        Ok(Self {
            server: server.trim_end_matches('/').to_string(),
            cache_dir: cache_dir.into(),
            client: http_client(timeout)?,
            privileges,
        })
    }

    /// Fetch every file, one thread each, returning one local path per input.
    ///
    /// Paths arrive in completion order.
    pub fn download(&self, files: &[ImageFile]) -> Result<Vec<PathBuf>> {
        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<Result<PathBuf>>();

        for file in files {
            let tx = tx.clone();
            let file = file.clone();
            let client = self.client.clone();
            let server = self.server.clone();
            let cache_dir = self.cache_dir.clone();
            let privileges = Arc::clone(&self.privileges);
            let cancel = Arc::clone(&cancel);

            thread::Builder::new()
                .name(format!("download-{}", file.file_name()))
                .spawn(move || {
                    let result = privileges.unprivileged().and_then(|_lease| {
                        Fetch {
                            client: &client,
                            server: &server,
                            cache_dir: &cache_dir,
                            cancel: &cancel,
                        }
                        .file(&file)
                    });
                    let _ = tx.send(result);
                })?;
        }
        drop(tx);

        let mut paths = Vec::with_capacity(files.len());
        for _ in 0..files.len() {
            match rx.recv() {
                Ok(Ok(path)) => paths.push(path),
                Ok(Err(err)) => {
                    cancel.store(true, Ordering::Relaxed);
                    return Err(err);
                }
                Err(_) => {
                    return Err(ProvisionError::download(
                        self.server.as_str(),
                        "download worker exited without reporting",
                    ))
                }
            }
        }
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::GET;
    use httpmock::MockServer;
    use tempfile::tempdir;
    use uemu_hal::{FakeHal, Identity};

    fn file(path: &str, body: &[u8], order: u32) -> ImageFile {
        ImageFile {
            path: path.to_string(),
            signature: None,
            checksum: format!("{:x}", Sha256::digest(body)),
            size: body.len() as u64,
            order,
        }
    }

    fn manager(server: &MockServer, cache: &Path) -> DownloadManager {
        let hal = FakeHal::new();
        let privileges =
            Privileges::with_identity(Arc::new(hal), Identity::new(1000, 1000)).unwrap();
        DownloadManager::new(
            &server.base_url(),
            cache,
            Duration::from_secs(5),
            privileges,
        )
        .unwrap()
    }

    #[test]
    fn relative_paths() {
        let server = "https://system-image.ubports.com/";
        assert_eq!(
            relative_to_server("/pool/a.tar.xz", server).unwrap(),
            "/pool/a.tar.xz"
        );
        assert_eq!(
            relative_to_server("https://system-image.ubports.com/pool/a.tar.xz", server)
                .unwrap(),
            "/pool/a.tar.xz"
        );
        assert!(relative_to_server("https://elsewhere.example/pool/a.tar.xz", server).is_err());
    }

    #[test]
    fn downloads_one_path_per_file() {
        let server = MockServer::start();
        let bodies: Vec<(String, Vec<u8>)> = (0..3)
            .map(|i| (format!("/pool/file-{}.tar.xz", i), vec![b'a' + i as u8; 1000 * (i + 1)]))
            .collect();
        for (path, body) in &bodies {
            server.mock(|when, then| {
                when.method(GET).path(path.as_str());
                then.status(200).body(body.clone());
            });
        }
        let files: Vec<ImageFile> = bodies
            .iter()
            .enumerate()
            .map(|(i, (p, b))| file(p, b, i as u32))
            .collect();

        let cache = tempdir().unwrap();
        let mut paths = manager(&server, cache.path()).download(&files).unwrap();
        paths.sort();

        assert_eq!(paths.len(), 3);
        for (i, (path, body)) in bodies.iter().enumerate() {
            assert_eq!(paths[i], cache_path(cache.path(), path));
            assert_eq!(fs::read(&paths[i]).unwrap(), *body);
        }
    }

    #[test]
    fn any_failure_fails_the_whole_set() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/pool/good.tar.xz");
            then.status(200).body("good");
        });
        server.mock(|when, then| {
            when.method(GET).path("/pool/missing.tar.xz");
            then.status(404);
        });
        let files = vec![
            file("/pool/good.tar.xz", b"good", 0),
            file("/pool/missing.tar.xz", b"missing", 1),
        ];

        let cache = tempdir().unwrap();
        let err = manager(&server, cache.path()).download(&files).unwrap_err();
        match err {
            ProvisionError::Download { url, .. } => assert!(url.ends_with("/pool/missing.tar.xz")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn checksum_mismatch_is_rejected() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/pool/a.tar.xz");
            then.status(200).body("tampered");
        });
        let files = vec![file("/pool/a.tar.xz", b"original", 0)];
        let cache = tempdir().unwrap();
        let err = manager(&server, cache.path()).download(&files).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
        assert!(!cache.path().join("pool/a.tar.xz").exists());
    }

    #[test]
    fn valid_cache_entry_is_reused() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/pool/a.tar.xz");
            then.status(200).body("fresh");
        });
        let cache = tempdir().unwrap();
        let cached = cache.path().join("pool/a.tar.xz");
        fs::create_dir_all(cached.parent().unwrap()).unwrap();
        fs::write(&cached, "fresh").unwrap();

        let files = vec![file("/pool/a.tar.xz", b"fresh", 0)];
        let paths = manager(&server, cache.path()).download(&files).unwrap();
        assert_eq!(paths, vec![cached]);
        mock.assert_hits(0);
    }

    #[test]
    fn stale_cache_entry_is_replaced_and_signature_fetched() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/pool/a.tar.xz");
            then.status(200).body("fresh");
        });
        let sig = server.mock(|when, then| {
            when.method(GET).path("/pool/a.tar.xz.asc");
            then.status(200).body("-----BEGIN PGP SIGNATURE-----");
        });
        let cache = tempdir().unwrap();
        let cached = cache.path().join("pool/a.tar.xz");
        fs::create_dir_all(cached.parent().unwrap()).unwrap();
        fs::write(&cached, "stale").unwrap();

        let mut entry = file("/pool/a.tar.xz", b"fresh", 0);
        entry.signature = Some("/pool/a.tar.xz.asc".to_string());
        manager(&server, cache.path()).download(&[entry]).unwrap();

        assert_eq!(fs::read(&cached).unwrap(), b"fresh");
        assert!(cache.path().join("pool/a.tar.xz.asc").is_file());
        sig.assert();
    }
}
