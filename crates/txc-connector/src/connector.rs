use std::ffi::{CStr, CString, c_int};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use txc_core::{LogLevel, Result, TxcError};

use crate::buffer::{TCStr, parse_send_response};
use crate::callback::{self, BoxT};
use crate::ffi::{self, Api, CallbackFn};
use crate::stream::Stream;

/// Arguments of `Initialize` / `InitializeEx`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitOptions {
    /// Directory for the connector's own logs (XDF*.log, DSP*.txt, TS*.log).
    pub log_dir: PathBuf,
    pub log_level: LogLevel,
    /// Days to keep connector log files. Needs `InitializeEx`.
    pub logfile_lifetime: Option<u32>,
}

impl InitOptions {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self { log_dir: log_dir.into(), log_level: LogLevel::default(), logfile_lifetime: None }
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn logfile_lifetime(mut self, days: Option<u32>) -> Self {
        self.logfile_lifetime = days;
        self
    }

    /// `<init .../>` document for `InitializeEx`.
    pub fn init_xml(&self) -> String {
        let mut xml = String::from("<init log_path=\"");
        escape_attr(&mut xml, &self.log_dir.display().to_string());
        let _ = write!(xml, "\" log_level=\"{}\"", self.log_level.as_raw());
        if let Some(days) = self.logfile_lifetime {
            let _ = write!(xml, " logfile_lifetime=\"{days}\"");
        }
        xml.push_str("/>");
        xml
    }
}

fn escape_attr(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
}

/// One initialized connector instance.
///
/// The connector library keeps global state, so a process should hold a
/// single `TransaqConnector` per loaded library. Dropping it calls
/// `UnInitialize` and then releases the installed callbacks.
///
/// ```no_run
/// use txc_connector::{InitOptions, Stream, TransaqConnector};
///
/// # fn main() -> txc_core::Result<()> {
/// let mut txc = TransaqConnector::new("C:/txc".as_ref(), &InitOptions::new("logs"))?;
/// txc.input_stream().subscribe(|msg| println!("{msg}"))?;
/// let reply = txc.sender().send(r#"<command id="get_connector_version"/>"#)?;
/// println!("{reply}");
/// # Ok(()) }
/// ```
pub struct TransaqConnector {
    callbacks: Vec<BoxT>,
    api: Arc<Api>,
    initialized: bool,
}

impl TransaqConnector {
    /// Load the library at `lib_path` (a file or the directory holding it)
    /// and initialize it.
    pub fn new(lib_path: &Path, opts: &InitOptions) -> Result<Self> {
        let file = ffi::resolve_library_path(lib_path)?;
        Self::with_api(Api::load(&file)?, opts)
    }

    /// Initialize an already loaded export table.
    pub fn with_api(api: Arc<Api>, opts: &InitOptions) -> Result<Self> {
        let mut txc = Self { callbacks: Vec::new(), api, initialized: false };
        txc.initialize(opts)?;
        Ok(txc)
    }

    /// (Re)initialize. Allowed again only while the connector is stopped.
    pub fn initialize(&mut self, opts: &InitOptions) -> Result<()> {
        if !opts.log_dir.is_dir() {
            return Err(TxcError::InvalidArgument(format!(
                "log directory {} does not exist",
                opts.log_dir.display()
            )));
        }

        let rc = match opts.logfile_lifetime {
            Some(_) if self.api.has_initialize_ex() => {
                let xml = c_string(opts.init_xml())?;
                debug!("InitializeEx {xml:?}");
                self.api.initialize_ex(&xml)
            }
            lifetime => {
                if lifetime.is_some() {
                    warn!("connector has no InitializeEx, logfile_lifetime ignored");
                }
                None
            }
        };
        let rc = match rc {
            Some(rc) => rc,
            None => {
                let dir = c_string(opts.log_dir.display().to_string())?;
                self.api.initialize(&dir, opts.log_level.as_raw() as c_int)
            }
        };
        self.check("Initialize", rc)?;
        self.initialized = true;
        info!(
            "connector initialized, logs in {} (level {})",
            opts.log_dir.display(),
            opts.log_level
        );
        Ok(())
    }

    /// Change the connector log depth without stopping it.
    pub fn set_log_level(&self, level: LogLevel) -> Result<()> {
        let rc = self.api.set_log_level(level.as_raw() as c_int);
        self.check("SetLogLevel", rc)
    }

    pub fn sender(&self) -> Sender {
        Sender { api: Arc::clone(&self.api) }
    }

    /// Source of asynchronous connector messages.
    ///
    /// Subscribing replaces the previously installed callback.
    pub fn input_stream(&mut self) -> InputStream<'_> {
        InputStream { txc: self }
    }

    /// Install `f` as the callback directly, without a pipeline.
    pub fn install_callback<F>(&mut self, f: F) -> Result<()>
    where
        F: FnMut(TCStr) + Send + 'static,
    {
        let ctx = callback::install(&self.api, f)?;
        self.callbacks.push(ctx);
        Ok(())
    }

    /// Bind a plain function with `SetCallback`.
    ///
    /// # Safety
    /// `callback` receives ownership of every buffer and must release it with
    /// `FreeMemory` of this same library.
    pub unsafe fn set_raw_callback(&mut self, callback: CallbackFn) -> Result<()> {
        match unsafe { self.api.set_callback(callback) } {
            Some(true) => Ok(()),
            Some(false) => Err(TxcError::Connector("SetCallback rejected the callback".into())),
            None => Err(TxcError::Load("connector has no SetCallback export".into())),
        }
    }

    /// Stop the connector threads and close its log files. Idempotent.
    pub fn uninitialize(&mut self) -> Result<()> {
        if !self.initialized {
            return Ok(());
        }
        let rc = self.api.uninitialize();
        self.check("UnInitialize", rc)?;
        self.initialized = false;
        // no connector thread is left to call into replaced or current contexts
        self.callbacks.clear();
        info!("connector uninitialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn api(&self) -> &Arc<Api> {
        &self.api
    }

    /// NULL means success, anything else is an error text to be released.
    fn check(&self, call: &str, rc: *mut u8) -> Result<()> {
        // SAFETY: lifecycle calls return NULL or a connector-owned buffer.
        match unsafe { TCStr::from_raw(rc, Arc::clone(&self.api)) } {
            None => Ok(()),
            Some(msg) => Err(TxcError::Connector(format!("{call}: {msg}"))),
        }
    }
}

impl Drop for TransaqConnector {
    fn drop(&mut self) {
        if let Err(e) = self.uninitialize() {
            // the connector may still call into the installed contexts, and
            // its code must stay mapped
            let leaked = std::mem::take(&mut self.callbacks);
            error!(
                "failed to uninitialize connector: {e}; leaking {} callback context(s)",
                leaked.len()
            );
            std::mem::forget(leaked);
            std::mem::forget(Arc::clone(&self.api));
        }
    }
}

impl std::fmt::Debug for TransaqConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransaqConnector")
            .field("api", &self.api)
            .field("callbacks", &self.callbacks.len())
            .field("initialized", &self.initialized)
            .finish()
    }
}

fn c_string(s: String) -> Result<CString> {
    CString::new(s)
        .map_err(|e| TxcError::InvalidArgument(format!("interior NUL at {}", e.nul_position())))
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

/// Cheap handle for `SendCommand`; usable from any thread.
#[derive(Clone, Debug)]
pub struct Sender {
    api: Arc<Api>,
}

impl Sender {
    /// Send one XML command and return the connector's successful reply.
    ///
    /// Input already terminated by `\0` is passed without copying.
    pub fn send<C: AsRef<[u8]>>(&self, command: C) -> Result<TCStr> {
        let bytes = command.as_ref();
        let rc = if bytes.last() == Some(&0) {
            let cmd = CStr::from_bytes_with_nul(bytes)
                .map_err(|_| TxcError::InvalidArgument("command contains an interior NUL".into()))?;
            self.api.send_command(cmd)
        } else {
            let cmd = CString::new(bytes)
                .map_err(|_| TxcError::InvalidArgument("command contains an interior NUL".into()))?;
            self.api.send_command(&cmd)
        };
        // SAFETY: SendCommand returns a connector-owned buffer or NULL.
        let reply = unsafe { TCStr::from_raw(rc, Arc::clone(&self.api)) }
            .ok_or(TxcError::NullReply("SendCommand"))?;
        parse_send_response(reply)
    }
}

// ---------------------------------------------------------------------------
// Input stream
// ---------------------------------------------------------------------------

/// Head of an input pipeline, see [`Stream`].
#[derive(Debug)]
pub struct InputStream<'a> {
    txc: &'a mut TransaqConnector,
}

impl Stream for InputStream<'_> {
    type Output = TCStr;

    fn subscribe<F>(self, f: F) -> Result<()>
    where
        F: FnMut(TCStr) + Send + 'static,
    {
        self.txc.install_callback(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock;
    use crossbeam_channel::RecvTimeoutError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    /// Counts how many callback contexts were dropped.
    struct DropCounter(Arc<AtomicUsize>);

    impl DropCounter {
        fn touch(&self) {}
    }

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn log_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("txc-conn-{name}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn init_xml_escapes_and_includes_lifetime() {
        let opts = InitOptions::new("C:\\a&b\"")
            .log_level(LogLevel::Maximum)
            .logfile_lifetime(Some(7));
        assert_eq!(
            opts.init_xml(),
            r#"<init log_path="C:\a&amp;b&quot;" log_level="3" logfile_lifetime="7"/>"#
        );
        assert_eq!(InitOptions::new("x").init_xml(), r#"<init log_path="x" log_level="2"/>"#);
    }

    #[test]
    fn missing_log_dir_is_rejected() {
        let _g = mock::lock();
        let opts = InitOptions::new("/definitely/not/here/txc");
        let err = TransaqConnector::with_api(mock::api(), &opts).unwrap_err();
        assert!(matches!(err, TxcError::InvalidArgument(_)));
        assert!(!mock::is_initialized());
    }

    #[test]
    fn lifecycle_and_send() {
        let _g = mock::lock();
        let dir = log_dir("life");
        {
            let mut txc = TransaqConnector::with_api(mock::api(), &InitOptions::new(&dir)).unwrap();
            assert!(txc.is_initialized());
            assert_eq!(mock::log_dir().as_deref(), Some(dir.display().to_string().as_str()));
            assert_eq!(mock::log_level(), Some(2));

            let sender = txc.sender();
            let reply = sender.send(r#"<command id="server_status"/>"#).unwrap();
            assert_eq!(reply.to_bytes(), br#"<result success="true"/>"#);
            // pre-terminated input is passed through
            let reply = sender.send(b"<command id=\"new_order\"/>\0").unwrap();
            assert_eq!(crate::transaction_id(&reply), Some(1));
            drop(reply);

            let err = sender.send(r#"<command id="bogus"/>"#).unwrap_err();
            assert!(
                matches!(err, TxcError::InvalidCommand(ref m) if m.contains("unknown command"))
            );
            let err = sender.send("not xml").unwrap_err();
            assert!(matches!(err, TxcError::Connector(ref m) if m == "<error>Wrong XML</error>"));
            let err = sender.send(b"<a/>\0<b/>\0").unwrap_err();
            assert!(matches!(err, TxcError::InvalidArgument(_)));

            txc.set_log_level(LogLevel::Maximum).unwrap();
            assert_eq!(mock::log_level(), Some(3));

            txc.uninitialize().unwrap();
            txc.uninitialize().unwrap();
            assert!(!mock::is_initialized());
        }
        assert_eq!(mock::live_buffers(), 0);
        assert_eq!(mock::commands().len(), 4);
    }

    #[test]
    fn lifecycle_errors_carry_connector_text() {
        let _g = mock::lock();
        let dir = log_dir("err");
        let txc = TransaqConnector::with_api(mock::api(), &InitOptions::new(&dir)).unwrap();
        // unknown levels map to Default before reaching the connector
        txc.set_log_level(LogLevel::from(9)).unwrap();
        let rc = txc.api.set_log_level(0);
        let err = txc.check("SetLogLevel", rc).unwrap_err();
        assert!(matches!(err, TxcError::Connector(ref m) if m.starts_with("SetLogLevel: ")));
        drop(txc);
        assert_eq!(mock::live_buffers(), 0);
    }

    #[test]
    fn subscribe_receives_callbacks() {
        let _g = mock::lock();
        let dir = log_dir("sub");
        let mut txc = TransaqConnector::with_api(mock::api(), &InitOptions::new(&dir)).unwrap();

        let (tx, rx) = crossbeam_channel::unbounded();
        txc.input_stream()
            .map(|buf| buf.to_string_lossy().into_owned())
            .filter(|msg| msg.starts_with("<server_status"))
            .subscribe(move |msg| {
                let _ = tx.send(msg);
            })
            .unwrap();

        let sender = txc.sender();
        sender.send(r#"<command id="get_connector_version"/>"#).unwrap();
        sender.send(r#"<command id="connect"/>"#).unwrap();
        let msg = rx.recv_timeout(WAIT).unwrap();
        assert!(msg.contains(r#"connected="true""#), "{msg}");
        assert!(mock::is_connected());

        drop(txc);
        // filtered and delivered buffers alike were released
        assert_eq!(mock::live_buffers(), 0);
        assert_eq!(rx.recv_timeout(Duration::from_millis(50)), Err(RecvTimeoutError::Disconnected));
    }

    #[test]
    fn initialize_ex_used_when_lifetime_is_set() {
        let _g = mock::lock();
        let dir = log_dir("ex");
        let opts = InitOptions::new(&dir).log_level(LogLevel::Minimum).logfile_lifetime(Some(3));
        let _txc = TransaqConnector::with_api(mock::api(), &opts).unwrap();
        assert_eq!(mock::init_xml(), Some(opts.init_xml()));
        assert_eq!(mock::log_level(), Some(1));
    }

    #[test]
    fn legacy_library_falls_back_to_initialize() {
        let _g = mock::lock();
        let dir = log_dir("legacy");
        let opts = InitOptions::new(&dir).logfile_lifetime(Some(3));
        let mut txc = TransaqConnector::with_api(mock::legacy_api(), &opts).unwrap();
        assert!(mock::is_initialized());
        assert_eq!(mock::init_xml(), None);

        extern "C" fn ignore(_: *const u8) -> bool {
            true
        }
        let err = unsafe { txc.set_raw_callback(ignore) }.unwrap_err();
        assert!(matches!(err, TxcError::Load(_)));
    }

    #[test]
    fn raw_callback_owns_its_buffers() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        static API: std::sync::OnceLock<Arc<Api>> = std::sync::OnceLock::new();

        extern "C" fn on_message(data: *const u8) -> bool {
            CALLS.fetch_add(1, Ordering::SeqCst);
            if let Some(api) = API.get() {
                unsafe { api.free_memory(data.cast_mut()) };
            }
            true
        }

        let _g = mock::lock();
        let api = API.get_or_init(mock::api).clone();
        let dir = log_dir("raw");
        let mut txc = TransaqConnector::with_api(api, &InitOptions::new(&dir)).unwrap();
        unsafe { txc.set_raw_callback(on_message) }.unwrap();
        let before = CALLS.load(Ordering::SeqCst);
        mock::emit("<news_header/>");

        let deadline = std::time::Instant::now() + WAIT;
        while CALLS.load(Ordering::SeqCst) == before && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(CALLS.load(Ordering::SeqCst), before + 1);
        drop(txc);
        assert_eq!(mock::live_buffers(), 0);
    }

    #[test]
    fn reinitialize_while_connected_fails() {
        let _g = mock::lock();
        let dir = log_dir("reinit");
        let opts = InitOptions::new(&dir);
        let mut txc = TransaqConnector::with_api(mock::api(), &opts).unwrap();
        txc.sender().send(r#"<command id="connect"/>"#).unwrap();
        let err = txc.initialize(&opts).unwrap_err();
        assert!(matches!(err, TxcError::Connector(ref m) if m.starts_with("Initialize: ")));
        txc.sender().send(r#"<command id="disconnect"/>"#).unwrap();
        txc.initialize(&opts.clone().log_level(LogLevel::Maximum)).unwrap();
        assert_eq!(mock::log_level(), Some(3));
    }

    #[test]
    fn uninitialize_releases_callback_contexts() {
        let _g = mock::lock();
        let dir = log_dir("release");
        let drops = Arc::new(AtomicUsize::new(0));
        let mut txc = TransaqConnector::with_api(mock::api(), &InitOptions::new(&dir)).unwrap();
        for _ in 0..2 {
            let tracked = DropCounter(Arc::clone(&drops));
            txc.install_callback(move |_| tracked.touch()).unwrap();
        }
        // the replaced context outlives its replacement call
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        txc.uninitialize().unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 2);
        drop(txc);
        assert_eq!(drops.load(Ordering::SeqCst), 2);
        assert_eq!(mock::live_buffers(), 0);
    }

    #[test]
    fn failed_uninitialize_leaks_callback_contexts() {
        let _g = mock::lock();
        let dir = log_dir("stuck");
        let drops = Arc::new(AtomicUsize::new(0));
        let api = mock::stuck_api();
        let opts = InitOptions::new(&dir);
        let mut txc = TransaqConnector::with_api(Arc::clone(&api), &opts).unwrap();

        let (tx, rx) = crossbeam_channel::unbounded();
        let tracked = DropCounter(Arc::clone(&drops));
        txc.install_callback(move |buf| {
            tracked.touch();
            let _ = tx.send(buf.to_string_lossy().into_owned());
        })
        .unwrap();

        let err = txc.uninitialize().unwrap_err();
        assert!(matches!(err, TxcError::Connector(ref m) if m.starts_with("UnInitialize: ")));
        assert!(txc.is_initialized());
        drop(txc);
        assert!(mock::is_initialized());
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        // the library handle is kept as well
        assert!(Arc::strong_count(&api) >= 2);

        // the connector keeps delivering into the context it was given
        mock::emit("<news_header/>");
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "<news_header/>");
        assert_eq!(drops.load(Ordering::SeqCst), 0);
    }
}
