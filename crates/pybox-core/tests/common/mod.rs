#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use pybox_core::{
    Downloader, Effects, EngineConfig, EnvOverrides, LockPolicy, PackageRequirement, Platform,
    ProcessRunner, Provisioner, Release, ReleaseRegistry, RemoteAsset, RunOutput,
};
use sha2::{Digest, Sha256};
use tar::{Builder, EntryType, Header};
use tempfile::TempDir;

pub const TRIPLE: &str = "x86_64-unknown-linux-gnu";
const BASE_URL: &str = "https://downloads.invalid";

pub fn linux() -> &'static Platform {
    Platform::lookup("linux", "x86_64").expect("linux x86_64 is supported")
}

/// `install_only`-shaped archive with a single `python/` top-level directory.
pub fn runtime_tar(version: &str) -> Vec<u8> {
    let mut builder = Builder::new(Vec::new());
    let files: [(&str, String, u32); 2] = [
        ("python/bin/python3", format!("#!fake-python {version}\n"), 0o755),
        ("python/lib/python3/os.py", "# stdlib\n".to_string(), 0o644),
    ];
    for (path, contents, mode) in files {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(contents.len() as u64);
        header.set_mode(mode);
        builder
            .append_data(&mut header, path, contents.as_bytes())
            .expect("append tar entry");
    }
    builder.into_inner().expect("finish tar")
}

pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(bytes).expect("gzip");
    encoder.finish().expect("gzip finish")
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn asset_name(version: &str, build: &str, ext: &str) -> String {
    format!("cpython-{version}+{build}-{TRIPLE}-install_only.tar.{ext}")
}

pub fn url_for(name: &str) -> String {
    format!("{BASE_URL}/{name}")
}

/// Release catalog and download server built together so every listed asset is fetchable.
#[derive(Default)]
pub struct Catalog {
    pub releases: Vec<Release>,
    pub files: HashMap<String, Vec<u8>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a release with one `.tar.gz` (or `.tar.zst` for `zst`) build per version, each with a
    /// valid checksum companion.
    pub fn release(mut self, tag: &str, versions: &[&str], ext: &str) -> Self {
        let mut assets = Vec::new();
        for version in versions {
            let name = asset_name(version, tag, ext);
            let tar = runtime_tar(version);
            let archive = if ext == "zst" {
                zstd::encode_all(&tar[..], 0).expect("zstd")
            } else {
                gzip(&tar)
            };
            let checksum_name = format!("{name}.sha256");
            self.files.insert(
                url_for(&checksum_name),
                format!("{}  {name}\n", sha256_hex(&archive)).into_bytes(),
            );
            self.files.insert(url_for(&name), archive);
            assets.push(RemoteAsset {
                url: url_for(&checksum_name),
                name: checksum_name,
            });
            assets.push(RemoteAsset {
                url: url_for(&name),
                name,
            });
        }
        self.releases.push(Release {
            tag_name: tag.to_string(),
            draft: false,
            assets,
        });
        self
    }

    pub fn draft(mut self, tag: &str, versions: &[&str]) -> Self {
        self = self.release(tag, versions, "gz");
        if let Some(last) = self.releases.last_mut() {
            last.draft = true;
        }
        self
    }

    /// Drop the checksum companions of the most recent release.
    pub fn without_checksums(mut self) -> Self {
        if let Some(last) = self.releases.last_mut() {
            last.assets.retain(|asset| !asset.name.ends_with(".sha256"));
        }
        self
    }

    /// Replace the published checksum of `name` with a digest that cannot match.
    pub fn corrupt_checksum(mut self, name: &str) -> Self {
        self.files.insert(
            url_for(&format!("{name}.sha256")),
            format!("{}  {name}\n", "0".repeat(64)).into_bytes(),
        );
        self
    }
}

pub struct FakeRegistry {
    releases: Vec<Release>,
    pub pages: Mutex<Vec<(u32, u32)>>,
}

impl ReleaseRegistry for FakeRegistry {
    fn releases_page(&self, page: u32, per_page: u32) -> Result<Vec<Release>> {
        self.pages.lock().unwrap().push((page, per_page));
        let start = (page.saturating_sub(1) * per_page) as usize;
        Ok(self
            .releases
            .iter()
            .skip(start)
            .take(per_page as usize)
            .cloned()
            .collect())
    }
}

pub struct FakeDownloader {
    files: HashMap<String, Vec<u8>>,
    pub requests: Mutex<Vec<String>>,
}

impl FakeDownloader {
    pub fn archive_downloads(&self) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|url| !url.ends_with(".sha256"))
            .count()
    }
}

impl Downloader for FakeDownloader {
    fn download(&self, url: &str) -> Result<Vec<u8>> {
        self.requests.lock().unwrap().push(url.to_string());
        self.files
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("404 Not Found: {url}"))
    }
}

#[derive(Clone, Debug)]
pub struct Call {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub envs: EnvOverrides,
}

/// Scripted stand-in for the runtime interpreter, venv-created interpreters, and pip.
#[derive(Default)]
pub struct FakePython {
    pub calls: Mutex<Vec<Call>>,
    pub venv_creations: AtomicUsize,
    pub fail_venv: bool,
    packages: Mutex<HashMap<PathBuf, Vec<(String, String)>>>,
}

impl FakePython {
    pub fn failing_venv() -> Self {
        Self {
            fail_venv: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// `pip` invocations as `(subcommand, remaining args)`.
    pub fn pip_calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls()
            .into_iter()
            .filter(|call| call.args.get(1).map(String::as_str) == Some("pip"))
            .map(|call| (call.args[2].clone(), call.args[3..].to_vec()))
            .collect()
    }

    fn create_venv(&self, runtime_python: &Path, target: &Path) -> RunOutput {
        thread::sleep(Duration::from_millis(20));
        if self.fail_venv {
            return output(1, "", "Error: ensurepip failed");
        }
        let version = runtime_python
            .parent()
            .and_then(Path::parent)
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        fs::create_dir_all(target.join("bin")).unwrap();
        fs::write(target.join("bin/python"), "#!fake-venv\n").unwrap();
        fs::write(
            target.join("pyvenv.cfg"),
            format!(
                "home = {}\ninclude-system-site-packages = false\nversion = {version}\n",
                runtime_python.parent().unwrap().display()
            ),
        )
        .unwrap();
        self.packages.lock().unwrap().insert(
            target.join("bin/python"),
            vec![("pip".to_string(), "23.0.1".to_string())],
        );
        self.venv_creations.fetch_add(1, Ordering::SeqCst);
        output(0, "", "")
    }

    fn pip(&self, python: &Path, args: &[String]) -> RunOutput {
        let mut packages = self.packages.lock().unwrap();
        let installed = packages.entry(python.to_path_buf()).or_default();
        match args.first().map(String::as_str) {
            Some("list") => {
                let rows: Vec<String> = installed
                    .iter()
                    .map(|(name, version)| format!(r#"{{"name": "{name}", "version": "{version}"}}"#))
                    .collect();
                output(0, &format!("[{}]", rows.join(", ")), "")
            }
            Some("install") => {
                for spec in args.iter().skip(1).filter(|arg| !arg.starts_with("--")) {
                    let requirement = PackageRequirement::parse(spec).unwrap();
                    let version = ["==", ">="]
                        .iter()
                        .find_map(|op| spec.split_once(op).map(|(_, v)| v.trim().to_string()))
                        .unwrap_or_else(|| "1.0.0".to_string());
                    installed.retain(|(name, _)| name != &requirement.canonical_name());
                    installed.push((requirement.canonical_name(), version));
                }
                output(0, "", "")
            }
            _ => output(2, "", "unknown pip command"),
        }
    }
}

fn output(code: i32, stdout: &str, stderr: &str) -> RunOutput {
    RunOutput {
        code,
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
    }
}

impl ProcessRunner for FakePython {
    fn run(
        &self,
        program: &Path,
        args: &[String],
        envs: &EnvOverrides,
        _cwd: Option<&Path>,
    ) -> Result<RunOutput> {
        self.calls.lock().unwrap().push(Call {
            program: program.to_path_buf(),
            args: args.to_vec(),
            envs: envs.clone(),
        });
        let flags: Vec<&str> = args.iter().map(String::as_str).collect();
        Ok(match flags.as_slice() {
            ["-m", "venv", target] => self.create_venv(program, Path::new(target)),
            ["-m", "pip", ..] => self.pip(program, &args[2..]),
            _ => output(0, &args.join(" "), ""),
        })
    }
}

pub struct FakeEffects {
    pub registry: FakeRegistry,
    pub downloader: FakeDownloader,
    pub python: FakePython,
}

impl Effects for FakeEffects {
    fn registry(&self) -> &dyn ReleaseRegistry {
        &self.registry
    }

    fn downloader(&self) -> &dyn Downloader {
        &self.downloader
    }

    fn process(&self) -> &dyn ProcessRunner {
        &self.python
    }
}

pub fn fast_locks() -> LockPolicy {
    LockPolicy {
        retries: 400,
        min_backoff: Duration::from_millis(2),
        max_backoff: Duration::from_millis(25),
        stale_after: Duration::from_secs(30),
    }
}

pub struct Harness {
    pub cache: TempDir,
    pub effects: Arc<FakeEffects>,
    pub provisioner: Provisioner,
}

impl Harness {
    pub fn new(catalog: Catalog) -> Self {
        Self::build(catalog, FakePython::default(), |_| {})
    }

    pub fn build(
        catalog: Catalog,
        python: FakePython,
        configure: impl FnOnce(&mut EngineConfig),
    ) -> Self {
        let cache = tempfile::tempdir().expect("cache dir");
        let mut config = EngineConfig::new(cache.path().join("cache"));
        config.lock = fast_locks();
        configure(&mut config);
        let effects = Arc::new(FakeEffects {
            registry: FakeRegistry {
                releases: catalog.releases,
                pages: Mutex::new(Vec::new()),
            },
            downloader: FakeDownloader {
                files: catalog.files,
                requests: Mutex::new(Vec::new()),
            },
            python,
        });
        let provisioner = Provisioner::with_platform(config, effects.clone(), linux());
        Self {
            cache,
            effects,
            provisioner,
        }
    }

    pub fn cache_root(&self) -> PathBuf {
        self.provisioner.config().cache_root.clone()
    }
}

/// Default catalog: a newest release with 3.12.2/3.11.8 and an older one with zstd builds.
pub fn standard_catalog() -> Catalog {
    Catalog::new()
        .release("20240201", &["3.12.2", "3.11.8"], "gz")
        .release("20240101", &["3.12.1", "3.10.13"], "zst")
}
