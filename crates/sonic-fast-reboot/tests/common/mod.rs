//! In-process fakes for end-to-end reboot scenarios.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use sonic_fast_reboot::config::RebootConfig;
use sonic_fast_reboot::{
    BootImage, BootImageResolver, Collaborators, CommandError, ForwardingStateDumper,
    ForwardingSyncDaemon, HANDSHAKE_KEY, HostProbe, KernelLoader, MemoryStateStore, OrchAgent,
    RebootController, STATE_FIELD, ServiceRuntime,
};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Records every runtime call as `<op>:<service>`.
#[derive(Default)]
pub struct RecordingRuntime {
    pub calls: Mutex<Vec<String>>,
    pub failing: Mutex<HashSet<String>>,
    pub panic_on: Mutex<Option<String>>,
}

impl RecordingRuntime {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, op: &str, service: &str) -> Result<(), CommandError> {
        self.calls.lock().push(format!("{}:{}", op, service));
        if self.panic_on.lock().as_deref() == Some(service) {
            panic!("runtime exploded on {}", service);
        }
        if self.failing.lock().contains(service) {
            return Err(CommandError::unexpected_output(
                format!("systemctl {} {}", op, service),
                "unit failed",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceRuntime for RecordingRuntime {
    async fn start(&self, service: &str) -> Result<(), CommandError> {
        self.record("start", service)
    }

    async fn stop(&self, service: &str) -> Result<(), CommandError> {
        self.record("stop", service)
    }

    async fn kill(&self, service: &str) -> Result<(), CommandError> {
        self.record("kill", service)
    }

    async fn is_running(&self, _service: &str) -> Result<bool, CommandError> {
        Ok(false)
    }
}

/// orchagent that pauses on the first attempt unless told to refuse.
#[derive(Default)]
pub struct FakeOrchAgent {
    pub refuse: AtomicBool,
    pub pauses: AtomicUsize,
}

#[async_trait]
impl OrchAgent for FakeOrchAgent {
    async fn pause(&self) -> Result<bool, CommandError> {
        self.pauses.fetch_add(1, Ordering::SeqCst);
        Ok(!self.refuse.load(Ordering::SeqCst))
    }
}

/// syncd that writes a scripted terminal state shortly after being asked.
pub struct ScriptedSyncd {
    store: MemoryStateStore,
    outcome: Option<&'static str>,
    delay: Duration,
    pub requests: AtomicUsize,
}

impl ScriptedSyncd {
    pub fn new(store: MemoryStateStore, outcome: Option<&'static str>) -> Self {
        Self {
            store,
            outcome,
            delay: Duration::from_millis(300),
            requests: AtomicUsize::new(0),
        }
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ForwardingSyncDaemon for ScriptedSyncd {
    async fn request_pre_shutdown(&self) -> Result<(), CommandError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if let Some(outcome) = self.outcome {
            let store = self.store.clone();
            let delay = self.delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                store.insert(HANDSHAKE_KEY, STATE_FIELD, outcome);
            });
        }
        Ok(())
    }
}

/// Counts kernel primitive calls.
#[derive(Default)]
pub struct FakeKernel {
    pub loads: AtomicUsize,
    pub unloads: AtomicUsize,
    pub execs: AtomicUsize,
    pub power_cycles: AtomicUsize,
    pub cmdline: Mutex<Option<String>>,
}

impl FakeKernel {
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KernelLoader for FakeKernel {
    async fn load(&self, _image: &BootImage, cmdline: &str) -> Result<(), CommandError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        *self.cmdline.lock() = Some(cmdline.to_string());
        Ok(())
    }

    async fn unload(&self) -> Result<(), CommandError> {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn exec(&self) -> Result<(), CommandError> {
        self.execs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn power_cycle(&self) -> Result<(), CommandError> {
        self.power_cycles.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeImages {
    pub image: Option<BootImage>,
}

#[async_trait]
impl BootImageResolver for FakeImages {
    async fn next_image(&self) -> Result<Option<BootImage>, CommandError> {
        Ok(self.image.clone())
    }
}

#[derive(Default)]
pub struct FakeDumper {
    pub fail: AtomicBool,
    pub dumps: AtomicUsize,
}

#[async_trait]
impl ForwardingStateDumper for FakeDumper {
    async fn dump(&self, _target_dir: &Path) -> Result<(), CommandError> {
        self.dumps.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(CommandError::unexpected_output(
                "fast-reboot-dump.py",
                "fdb dump failed",
            ));
        }
        Ok(())
    }
}

pub struct FakeHost {
    pub privileged: bool,
    pub asic: String,
    pub space_mb: u64,
}

impl HostProbe for FakeHost {
    fn is_privileged(&self) -> bool {
        self.privileged
    }

    fn available_space_mb(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.space_mb)
    }

    fn asic_type(&self) -> io::Result<String> {
        Ok(self.asic.clone())
    }

    fn kernel_cmdline(&self) -> io::Result<String> {
        Ok("BOOT_IMAGE=/image-202311.1/boot/vmlinuz root=/dev/sda3 SONIC_BOOT_TYPE=warm".to_string())
    }
}

/// A complete fake switch.
pub struct Harness {
    pub temp_dir: TempDir,
    pub config: RebootConfig,
    pub runtime: Arc<RecordingRuntime>,
    pub orchagent: Arc<FakeOrchAgent>,
    pub syncd: Arc<ScriptedSyncd>,
    pub kernel: Arc<FakeKernel>,
    pub dumper: Arc<FakeDumper>,
    pub state_db: MemoryStateStore,
    pub asic_db: MemoryStateStore,
    pub host: FakeHost,
    pub image: Option<BootImage>,
}

impl Harness {
    /// Mellanox switch whose syncd answers with `syncd_outcome`.
    pub fn new(syncd_outcome: Option<&'static str>) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        let mut config = RebootConfig::default();
        config.paths.reboot_cause_file = root.join("reboot-cause").join("reboot-cause.txt");
        config.paths.lock_file = root.join("run").join("fast-reboot.lock");
        config.paths.image_volume = root.to_path_buf();
        config.paths.dump_dir = root.join("fast-reboot");
        config.snapshot.directory = root.join("warmboot");
        config.snapshot.dump_path = root.join("redis").join("asic_db.json");

        let state_db = MemoryStateStore::new("STATE_DB", root.join("redis").join("state_db.json"));
        let asic_db = MemoryStateStore::new("ASIC_DB", &config.snapshot.dump_path);
        let image = Some(install_image(root, "SONiC-OS-202405.1"));

        Self {
            syncd: Arc::new(ScriptedSyncd::new(state_db.clone(), syncd_outcome)),
            runtime: Arc::new(RecordingRuntime::default()),
            orchagent: Arc::new(FakeOrchAgent::default()),
            kernel: Arc::new(FakeKernel::default()),
            dumper: Arc::new(FakeDumper::default()),
            host: FakeHost {
                privileged: true,
                asic: "mellanox".to_string(),
                space_mb: 4096,
            },
            temp_dir,
            config,
            state_db,
            asic_db,
            image,
        }
    }

    pub fn controller(&self, cancel: CancellationToken) -> RebootController {
        let collaborators = Collaborators {
            runtime: self.runtime.clone(),
            orchagent: self.orchagent.clone(),
            syncd: self.syncd.clone(),
            kernel: self.kernel.clone(),
            images: Arc::new(FakeImages {
                image: self.image.clone(),
            }),
            dumper: self.dumper.clone(),
            host: Arc::new(FakeHost {
                privileged: self.host.privileged,
                asic: self.host.asic.clone(),
                space_mb: self.host.space_mb,
            }),
            state_db: Arc::new(self.state_db.clone()),
            asic_db: Arc::new(self.asic_db.clone()),
        };
        RebootController::new(collaborators, self.config.clone(), cancel)
    }

    /// Fills ASIC_DB with a mix of kept and excluded keys.
    pub fn seed_asic_db(&self) {
        let db = &self.asic_db;
        db.insert("ASIC_STATE:SAI_OBJECT_TYPE_SWITCH:oid:0x21000000000000", "SAI_SWITCH_ATTR_INIT_SWITCH", "true");
        db.insert("ASIC_STATE:SAI_OBJECT_TYPE_PORT:oid:0x1000000000002", "SAI_PORT_ATTR_ADMIN_STATE", "true");
        db.insert("VIDTORID", "oid:0x1000000000002", "oid:0x10002");
        db.insert("RIDTOVID", "oid:0x10002", "oid:0x1000000000002");
        db.insert("COUNTERS_PORT_NAME_MAP", "Ethernet0", "oid:0x1000000000002");
        db.insert("TEMP_ASIC_STATE:x", "f", "v");
    }

    pub fn enable_flag(&self, key: &str) -> Option<String> {
        self.state_db.get(key).and_then(|h| h.get("enable").cloned())
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.config.snapshot.durable_path()
    }

    /// No collaborator was touched and nothing was written.
    pub fn untouched(&self) -> bool {
        self.runtime.calls().is_empty()
            && FakeKernel::count(&self.kernel.loads) == 0
            && FakeKernel::count(&self.kernel.execs) == 0
            && FakeKernel::count(&self.kernel.power_cycles) == 0
            && self.orchagent.pauses.load(Ordering::SeqCst) == 0
            && self.syncd.requests() == 0
            && self.dumper.dumps.load(Ordering::SeqCst) == 0
            && self.state_db.is_empty()
            && !self.config.paths.reboot_cause_file.exists()
    }
}

/// Installs kernel and initrd for `name` under `volume`.
pub fn install_image(volume: &Path, name: &str) -> BootImage {
    let version = name.trim_start_matches("SONiC-OS-");
    let boot = volume.join(format!("image-{}", version)).join("boot");
    fs::create_dir_all(&boot).unwrap();
    let kernel = boot.join("vmlinuz-6.1.0-22-2-amd64");
    let initrd = boot.join("initrd.img-6.1.0-22-2-amd64");
    fs::write(&kernel, b"kernel").unwrap();
    fs::write(&initrd, b"initrd").unwrap();
    BootImage {
        name: name.to_string(),
        kernel,
        initrd,
    }
}
