//! FTP provider against a scripted in-process server.
#![cfg(feature = "ftp")]

use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufRead, BufReader, Cursor, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use docstore::models::FtpConfig;
use docstore::storage::ftp::FtpProvider;
use docstore::storage::hashing::hash_bytes;
use docstore::storage::{BucketProvider, CapabilityCache, StorageError, StorageProvider, UploadRequest};

const HOME: &str = "/home/alice";

#[derive(Default)]
struct Tree {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
}

fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(index) => &path[..index],
        None => "/",
    }
}

fn resolve(cwd: &str, arg: &str) -> String {
    let joined = if arg.starts_with('/') {
        arg.to_string()
    } else {
        format!("{}/{}", cwd, arg)
    };
    let mut segments: Vec<&str> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("/{}", segments.join("/"))
}

/// Minimal passive-mode FTP server over a shared in-memory tree.
struct FakeFtp {
    port: u16,
    tree: Arc<Mutex<Tree>>,
    quits: Arc<AtomicUsize>,
}

impl FakeFtp {
    fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut tree = Tree::default();
        for dir in ["/", "/home", HOME] {
            tree.dirs.insert(dir.to_string());
        }
        let tree = Arc::new(Mutex::new(tree));
        let quits = Arc::new(AtomicUsize::new(0));

        let (shared, counter) = (tree.clone(), quits.clone());
        thread::spawn(move || {
            for control in listener.incoming().flatten() {
                let (tree, quits) = (shared.clone(), counter.clone());
                thread::spawn(move || serve(control, tree, quits));
            }
        });

        Self { port, tree, quits }
    }

    fn provider(&self, root: &str) -> FtpProvider {
        FtpProvider::new(
            "ftp",
            "ftp:fake",
            FtpConfig {
                host: "127.0.0.1".to_string(),
                port: self.port,
                username: "alice".to_string(),
                password: "secret".to_string(),
                use_ssl: false,
                use_passive_mode: true,
                root_directory: root.to_string(),
                calculate_bucket_sizes: true,
            },
            Duration::from_secs(5),
            Arc::new(CapabilityCache::new()),
        )
    }

    fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.tree.lock().unwrap().files.get(path).cloned()
    }
}

fn reply(out: &mut TcpStream, line: String) {
    let _ = out.write_all(format!("{}\r\n", line).as_bytes());
}

fn serve(control: TcpStream, tree: Arc<Mutex<Tree>>, quits: Arc<AtomicUsize>) {
    let mut reader = BufReader::new(control.try_clone().unwrap());
    let mut out = control;
    let mut cwd = HOME.to_string();
    let mut data: Option<TcpListener> = None;

    reply(&mut out, "220 fake ftp ready".to_string());

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).unwrap_or(0) == 0 {
            return;
        }
        let trimmed = line.trim_end();
        let (command, arg) = trimmed.split_once(' ').unwrap_or((trimmed, ""));
        let path = resolve(&cwd, arg);

        let response = match command {
            "USER" => "331 Password required".to_string(),
            "PASS" => "230 Logged in".to_string(),
            "TYPE" => "200 Type set".to_string(),
            "PWD" => format!("257 \"{}\" is the current directory", cwd),
            "CWD" => {
                if tree.lock().unwrap().dirs.contains(&path) {
                    cwd = path;
                    "250 Directory changed".to_string()
                } else {
                    "550 No such file or directory.".to_string()
                }
            }
            "MKD" => {
                let mut tree = tree.lock().unwrap();
                if tree.dirs.contains(&path) || tree.files.contains_key(&path) {
                    "550 File exists.".to_string()
                } else if !tree.dirs.contains(parent(&path)) {
                    "550 No such file or directory.".to_string()
                } else {
                    tree.dirs.insert(path.clone());
                    format!("257 \"{}\" created", path)
                }
            }
            "RMD" => {
                let mut tree = tree.lock().unwrap();
                let prefix = format!("{}/", path);
                let occupied = tree.dirs.iter().any(|d| d.starts_with(&prefix))
                    || tree.files.keys().any(|f| f.starts_with(&prefix));
                if !tree.dirs.contains(&path) || occupied {
                    "550 Directory not empty.".to_string()
                } else {
                    tree.dirs.remove(&path);
                    "250 Directory removed".to_string()
                }
            }
            "DELE" => match tree.lock().unwrap().files.remove(&path) {
                Some(_) => "250 File deleted".to_string(),
                None => "550 No such file or directory.".to_string(),
            },
            "SIZE" => match tree.lock().unwrap().files.get(&path) {
                Some(content) => format!("213 {}", content.len()),
                None => "550 No such file or directory.".to_string(),
            },
            "PASV" => {
                let listener = TcpListener::bind("127.0.0.1:0").unwrap();
                let port = listener.local_addr().unwrap().port();
                data = Some(listener);
                format!("227 Entering Passive Mode (127,0,0,1,{},{})", port / 256, port % 256)
            }
            "STOR" => {
                let listener = data.take();
                if !tree.lock().unwrap().dirs.contains(parent(&path)) {
                    "550 No such file or directory.".to_string()
                } else {
                    reply(&mut out, "150 Ok to send data".to_string());
                    let (mut stream, _) = listener.unwrap().accept().unwrap();
                    let mut content = Vec::new();
                    stream.read_to_end(&mut content).unwrap();
                    tree.lock().unwrap().files.insert(path, content);
                    "226 Transfer complete".to_string()
                }
            }
            "RETR" => {
                let listener = data.take();
                let content = tree.lock().unwrap().files.get(&path).cloned();
                match content {
                    None => "550 No such file or directory.".to_string(),
                    Some(content) => {
                        reply(&mut out, "150 Opening data connection".to_string());
                        let (mut stream, _) = listener.unwrap().accept().unwrap();
                        let _ = stream.write_all(&content);
                        drop(stream);
                        "226 Transfer complete".to_string()
                    }
                }
            }
            "LIST" => {
                let listener = data.take();
                let listing = {
                    let tree = tree.lock().unwrap();
                    if tree.dirs.contains(&path) {
                        let dirs = tree
                            .dirs
                            .iter()
                            .filter(|d| d.as_str() != path && parent(d) == path)
                            .map(|d| format!("drwxr-xr-x 1 owner group 0 Jan 01 00:00 {}", &d[d.rfind('/').unwrap() + 1..]));
                        let files = tree.files.iter().filter(|(f, _)| parent(f) == path).map(|(f, content)| {
                            format!(
                                "-rw-r--r-- 1 owner group {} Jan 01 00:00 {}",
                                content.len(),
                                &f[f.rfind('/').unwrap() + 1..]
                            )
                        });
                        Some(dirs.chain(files).collect::<Vec<_>>())
                    } else {
                        None
                    }
                };
                match listing {
                    None => "550 No such file or directory.".to_string(),
                    Some(lines) => {
                        reply(&mut out, "150 Here comes the directory listing".to_string());
                        let (mut stream, _) = listener.unwrap().accept().unwrap();
                        for entry in lines {
                            let _ = stream.write_all(format!("{}\r\n", entry).as_bytes());
                        }
                        drop(stream);
                        "226 Directory send OK".to_string()
                    }
                }
            }
            "QUIT" => {
                quits.fetch_add(1, Ordering::SeqCst);
                reply(&mut out, "221 Goodbye".to_string());
                return;
            }
            _ => "502 Command not implemented".to_string(),
        };
        reply(&mut out, response);
    }
}

#[tokio::test]
async fn test_upload_download_delete_roundtrip() {
    let server = FakeFtp::start();
    let provider = server.provider("/srv");
    server.tree.lock().unwrap().dirs.insert("/srv".to_string());
    let cancel = CancellationToken::new();
    let data = b"%PDF-1.7 quarterly report".repeat(64);

    let request = UploadRequest::new("d1", "report.pdf");
    let result = provider.upload(&request, &mut Cursor::new(data.clone()), &cancel).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.content_hash.as_deref(), Some(hash_bytes(&data).as_str()));

    let storage_path = result.storage_path.unwrap();
    assert_eq!(server.file(&format!("/srv/{}", storage_path)), Some(data.clone()));
    assert!(provider.exists(&storage_path, &cancel).await);

    let stored_hash = provider.compute_hash(&storage_path, &cancel).await.unwrap();
    assert_eq!(Some(stored_hash), result.content_hash);

    provider.delete(&storage_path, &cancel).await.unwrap();
    assert!(!provider.exists(&storage_path, &cancel).await);
    provider.delete(&storage_path, &cancel).await.unwrap();

    let missing = provider.download(&storage_path, &cancel).await;
    assert!(matches!(missing, Err(StorageError::NotFound(_))));
}

#[tokio::test]
async fn test_relative_root_survives_directory_checks() {
    let server = FakeFtp::start();
    // Resolved against the login directory on every call.
    let provider = server.provider("docs");
    let cancel = CancellationToken::new();

    assert!(provider.create_bucket("reports", &cancel).await.success);
    assert!(provider.bucket_exists("reports", &cancel).await.unwrap());

    provider
        .upload_bytes("reports/q1.txt", b"first quarter", &cancel)
        .await
        .unwrap();
    assert_eq!(server.file("/home/alice/docs/reports/q1.txt"), Some(b"first quarter".to_vec()));

    let buckets = provider.list_buckets(&cancel).await.unwrap();
    assert_eq!(buckets.len(), 1);
    assert_eq!(buckets[0].name, "reports");
    assert_eq!(buckets[0].object_count, Some(1));

    let refused = provider.remove_bucket("reports", false, &cancel).await;
    assert!(!refused.success);
    assert!(refused.message.contains("not empty"), "{}", refused.message);

    assert!(provider.remove_bucket("reports", true, &cancel).await.success);
    assert!(!provider.bucket_exists("reports", &cancel).await.unwrap());
    assert!(provider.test_connection(&cancel).await.success);
}

#[tokio::test]
async fn test_cancelled_upload_closes_session_without_storing() {
    let server = FakeFtp::start();
    let provider = server.provider("/");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = provider.upload_bytes("default/d1/late.txt", b"too late", &cancel).await;
    assert!(matches!(result, Err(StorageError::Cancelled)));

    // The session has already sent QUIT by the time the call returns.
    assert_eq!(server.quits.load(Ordering::SeqCst), 1);
    assert_eq!(server.file("/default/d1/late.txt"), None);
}
