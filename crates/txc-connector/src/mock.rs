//! In-process stand-in for the connector library.
//!
//! Exposes the same export table as a loaded library ([`api`]) but keeps its
//! state in statics, like the real DLL does. Callbacks are delivered from a
//! dedicated thread so the asynchronous behaviour of the connector is kept.
//!
//! Only one test at a time may use the mock: hold the guard from [`lock`]
//! for the whole test. Taking and dropping the guard resets the state.

use std::ffi::{CStr, CString, c_int, c_void};
use std::sync::atomic::{AtomicIsize, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use tracing::debug;

use crate::buffer::xml_attr;
use crate::ffi::{Api, CallbackExFn, CallbackFn};

pub const CONNECTOR_VERSION: &str = "6.19.2.21.21";

struct State {
    initialized: bool,
    connected: bool,
    log_dir: Option<String>,
    log_level: Option<i32>,
    init_xml: Option<String>,
    callback_ex: Option<(CallbackExFn, usize)>,
    callback: Option<CallbackFn>,
    outbox: Option<Sender<String>>,
    worker: Option<JoinHandle<()>>,
    commands: Vec<String>,
}

impl State {
    const fn new() -> Self {
        Self {
            initialized: false,
            connected: false,
            log_dir: None,
            log_level: None,
            init_xml: None,
            callback_ex: None,
            callback: None,
            outbox: None,
            worker: None,
            commands: Vec::new(),
        }
    }
}

static STATE: Mutex<State> = Mutex::new(State::new());
static SERIAL: Mutex<()> = Mutex::new(());
static LIVE: AtomicIsize = AtomicIsize::new(0);
static NEXT_TRANSACTION: AtomicU64 = AtomicU64::new(1);

fn state() -> MutexGuard<'static, State> {
    STATE.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Exclusive use of the mock; state is reset on both ends.
pub struct MockGuard {
    _serial: MutexGuard<'static, ()>,
}

impl Drop for MockGuard {
    fn drop(&mut self) {
        reset();
    }
}

pub fn lock() -> MockGuard {
    let serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
    reset();
    MockGuard { _serial: serial }
}

fn reset() {
    let (outbox, worker) = {
        let mut st = state();
        let taken = (st.outbox.take(), st.worker.take());
        *st = State::new();
        taken
    };
    drop(outbox);
    join_worker(worker);
    LIVE.store(0, Ordering::SeqCst);
    NEXT_TRANSACTION.store(1, Ordering::SeqCst);
}

fn join_worker(worker: Option<JoinHandle<()>>) {
    if let Some(handle) = worker {
        // UnInitialize issued from inside a callback must not wait on itself
        if handle.thread().id() != thread::current().id() {
            let _ = handle.join();
        }
    }
}

/// Export table backed by the mock.
pub fn api() -> Arc<Api> {
    Arc::new(Api {
        fn_initialize: initialize,
        fn_initialize_ex: Some(initialize_ex),
        fn_set_log_level: set_log_level,
        fn_send_command: send_command,
        fn_set_callback: Some(set_callback),
        fn_set_callback_ex: set_callback_ex,
        fn_free_memory: free_memory,
        fn_uninitialize: uninitialize,
        path: None,
        lib: None,
    })
}

/// Export table of an older build without `InitializeEx` and `SetCallback`.
pub fn legacy_api() -> Arc<Api> {
    Arc::new(Api {
        fn_initialize: initialize,
        fn_initialize_ex: None,
        fn_set_log_level: set_log_level,
        fn_send_command: send_command,
        fn_set_callback: None,
        fn_set_callback_ex: set_callback_ex,
        fn_free_memory: free_memory,
        fn_uninitialize: uninitialize,
        path: None,
        lib: None,
    })
}

/// Export table whose `UnInitialize` always reports an error and leaves the
/// connector running.
pub fn stuck_api() -> Arc<Api> {
    Arc::new(Api {
        fn_initialize: initialize,
        fn_initialize_ex: Some(initialize_ex),
        fn_set_log_level: set_log_level,
        fn_send_command: send_command,
        fn_set_callback: Some(set_callback),
        fn_set_callback_ex: set_callback_ex,
        fn_free_memory: free_memory,
        fn_uninitialize: refuse_uninitialize,
        path: None,
        lib: None,
    })
}

/// Buffers handed out and not yet released with `FreeMemory`.
pub fn live_buffers() -> isize {
    LIVE.load(Ordering::SeqCst)
}

pub fn is_initialized() -> bool {
    state().initialized
}

pub fn is_connected() -> bool {
    state().connected
}

pub fn log_dir() -> Option<String> {
    state().log_dir.clone()
}

pub fn log_level() -> Option<i32> {
    state().log_level
}

/// Argument of the last `InitializeEx` call.
pub fn init_xml() -> Option<String> {
    state().init_xml.clone()
}

/// Every command received by `SendCommand`, in order.
pub fn commands() -> Vec<String> {
    state().commands.clone()
}

/// Queue `msg` for delivery through the installed callback.
pub fn emit(msg: impl Into<String>) {
    if let Some(tx) = &state().outbox {
        let _ = tx.send(msg.into());
    }
}

// ---------------------------------------------------------------------------
// Buffers
// ---------------------------------------------------------------------------

fn alloc(text: &str) -> *mut u8 {
    let owned = CString::new(text.replace('\0', "")).unwrap_or_default();
    LIVE.fetch_add(1, Ordering::SeqCst);
    owned.into_raw().cast()
}

unsafe fn read(ptr: *const u8) -> String {
    if ptr.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(ptr.cast()) }.to_string_lossy().into_owned()
}

// ---------------------------------------------------------------------------
// Exports
// ---------------------------------------------------------------------------

fn start(log_dir: String, log_level: i32) -> *mut u8 {
    let mut st = state();
    if st.connected {
        return alloc("Initialize is not allowed while connected");
    }
    st.initialized = true;
    st.log_dir = Some(log_dir);
    st.log_level = Some(log_level);
    if st.outbox.is_none() {
        let (tx, rx) = crossbeam_channel::unbounded::<String>();
        let worker = thread::Builder::new()
            .name("txc-mock-callback".into())
            .spawn(move || {
                for msg in rx {
                    deliver(&msg);
                }
            });
        match worker {
            Ok(handle) => {
                st.outbox = Some(tx);
                st.worker = Some(handle);
            }
            Err(e) => return alloc(&format!("cannot start callback thread: {e}")),
        }
    }
    std::ptr::null_mut()
}

fn deliver(msg: &str) {
    let (callback_ex, callback) = {
        let st = state();
        (st.callback_ex, st.callback)
    };
    if let Some((f, ctx)) = callback_ex {
        f(alloc(msg), ctx as *mut c_void);
    } else if let Some(f) = callback {
        f(alloc(msg));
    } else {
        debug!("mock: no callback installed, dropping {msg}");
    }
}

unsafe extern "C" fn initialize(log_path: *const u8, log_level: c_int) -> *mut u8 {
    let dir = unsafe { read(log_path) };
    start(dir, log_level)
}

unsafe extern "C" fn initialize_ex(xml: *const u8) -> *mut u8 {
    let xml = unsafe { read(xml) };
    let bytes = xml.as_bytes();
    let dir = xml_attr(bytes, "log_path").map(|v| String::from_utf8_lossy(v).into_owned());
    let level = xml_attr(bytes, "log_level")
        .and_then(|v| std::str::from_utf8(v).ok())
        .and_then(|v| v.parse().ok());
    let (Some(dir), Some(level)) = (dir, level) else {
        return alloc("InitializeEx: log_path and log_level are required");
    };
    let rc = start(dir, level);
    if rc.is_null() {
        state().init_xml = Some(xml);
    }
    rc
}

unsafe extern "C" fn set_log_level(log_level: c_int) -> *mut u8 {
    let mut st = state();
    if !(1..=3).contains(&log_level) {
        return alloc("log level must be 1, 2 or 3");
    }
    st.log_level = Some(log_level);
    std::ptr::null_mut()
}

unsafe extern "C" fn send_command(command: *const u8) -> *mut u8 {
    let command = unsafe { read(command) };
    let mut st = state();
    if !st.initialized {
        return alloc("<error>connector is not initialized</error>");
    }
    st.commands.push(command.clone());

    let bytes = command.as_bytes().trim_ascii_start();
    if !bytes.starts_with(b"<command") {
        return alloc("<error>Wrong XML</error>");
    }
    let id = xml_attr(bytes, "id")
        .map(|v| String::from_utf8_lossy(v).into_owned())
        .unwrap_or_default();

    let mut events = Vec::new();
    let reply = match id.as_str() {
        "connect" => {
            st.connected = true;
            events.push(r#"<server_status id="1" connected="true" recover="false"/>"#.to_string());
            r#"<result success="true"/>"#.to_string()
        }
        "disconnect" => {
            st.connected = false;
            events.push(r#"<server_status connected="false"/>"#.to_string());
            r#"<result success="true"/>"#.to_string()
        }
        "server_status" => {
            events.push(format!(r#"<server_status connected="{}"/>"#, st.connected));
            r#"<result success="true"/>"#.to_string()
        }
        "get_connector_version" => {
            events.push(format!("<connector_version>{CONNECTOR_VERSION}</connector_version>"));
            r#"<result success="true"/>"#.to_string()
        }
        "new_order" => {
            let n = NEXT_TRANSACTION.fetch_add(1, Ordering::SeqCst);
            format!(r#"<result success="true" transactionid="{n}"/>"#)
        }
        _ => r#"<result success="false"><message>unknown command</message></result>"#.to_string(),
    };
    if let Some(tx) = &st.outbox {
        for event in events {
            let _ = tx.send(event);
        }
    }
    alloc(&reply)
}

unsafe extern "C" fn set_callback(callback: CallbackFn) -> bool {
    let mut st = state();
    st.callback = Some(callback);
    st.callback_ex = None;
    true
}

unsafe extern "C" fn set_callback_ex(callback: CallbackExFn, ctx: *mut c_void) -> bool {
    let mut st = state();
    st.callback_ex = Some((callback, ctx as usize));
    st.callback = None;
    true
}

unsafe extern "C" fn free_memory(buffer: *mut u8) -> bool {
    if buffer.is_null() {
        return false;
    }
    drop(unsafe { CString::from_raw(buffer.cast()) });
    LIVE.fetch_sub(1, Ordering::SeqCst);
    true
}

unsafe extern "C" fn uninitialize() -> *mut u8 {
    let (outbox, worker) = {
        let mut st = state();
        st.initialized = false;
        st.connected = false;
        st.callback_ex = None;
        st.callback = None;
        (st.outbox.take(), st.worker.take())
    };
    drop(outbox);
    join_worker(worker);
    std::ptr::null_mut()
}

unsafe extern "C" fn refuse_uninitialize() -> *mut u8 {
    alloc("connector threads did not stop")
}
