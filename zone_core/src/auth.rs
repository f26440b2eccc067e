//! Authentication pipeline, §4.6. `AuthRequest::done()` is the
//! "coroutine-style async auth" from §9 Design Notes: an explicit object
//! whose completion continuation is posted to the mainloop queue rather
//! than any `async`/await machinery, matching how the rest of the core
//! favors explicit state objects over futures.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::warn;

use crate::error::AuthError;
use crate::mainloop::WorkQueue;

/// Permits-entry codes, fail-with-specific-reason codes, and the
/// operator-supplied-message variant, per §4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthCode {
    Ok,
    SpecOnly,
    NoScores,
    AskDemographics,
    NoPermission,
    LockedOut,
    NoNewConns,
    BadPassword,
    CustomText,
}

impl AuthCode {
    pub fn permits_entry(self) -> bool {
        matches!(
            self,
            AuthCode::Ok | AuthCode::SpecOnly | AuthCode::NoScores | AuthCode::AskDemographics
        )
    }
}

#[derive(Debug, Clone)]
pub struct AuthResult {
    pub code: AuthCode,
    pub authenticated: bool,
    /// Operator-supplied message; only meaningful when `code ==
    /// CustomText`.
    pub custom_text: Option<String>,
}

impl Default for AuthResult {
    fn default() -> Self {
        Self {
            code: AuthCode::NoPermission,
            authenticated: false,
            custom_text: None,
        }
    }
}

/// Typed view over the fixed-layout prefix of a login packet. Field widths
/// mirror the wire record; anything past `name`/`password` is opaque
/// `extra_bytes` for the biller.
#[derive(Debug, Clone, Default)]
pub struct LoginPacketView {
    pub name: String,
    pub password: String,
}

/// A single login attempt. `done()` MUST be called exactly once, on the
/// mainloop, when `result` is final (§4.6). Pooled and reused across
/// logins via [`AuthRequestPool`].
pub struct AuthRequest {
    pub pid: u32,
    pub login_bytes: Vec<u8>,
    pub login_packet: LoginPacketView,
    pub extra_bytes: Vec<u8>,
    pub result: Mutex<AuthResult>,
    done: AtomicBool,
    abandoned: AtomicBool,
    work_queue: Arc<WorkQueue>,
    on_complete: Mutex<Option<Box<dyn FnOnce(u32, AuthResult) + Send>>>,
}

impl AuthRequest {
    pub fn new(
        pid: u32,
        login_bytes: Vec<u8>,
        login_packet: LoginPacketView,
        extra_bytes: Vec<u8>,
        work_queue: Arc<WorkQueue>,
        on_complete: impl FnOnce(u32, AuthResult) + Send + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            pid,
            login_bytes,
            login_packet,
            extra_bytes,
            result: Mutex::new(AuthResult::default()),
            done: AtomicBool::new(false),
            abandoned: AtomicBool::new(false),
            work_queue,
            on_complete: Mutex::new(Some(Box::new(on_complete))),
        })
    }

    /// The player disconnected before `done()` fired; the eventual `done()`
    /// call becomes a no-op completion delivered nowhere (§5 "a pending
    /// authentication whose player disconnects is abandoned").
    pub fn abandon(&self) {
        self.abandoned.store(true, Ordering::SeqCst);
    }

    /// Must be called exactly once. Posts the completion continuation to
    /// the mainloop work queue.
    pub fn done(self: &Arc<Self>) -> Result<(), AuthError> {
        if self.done.swap(true, Ordering::SeqCst) {
            return Err(AuthError::AlreadyDone);
        }
        if self.abandoned.load(Ordering::SeqCst) {
            return Err(AuthError::Abandoned);
        }
        let pid = self.pid;
        let result = self.result.lock().unwrap().clone();
        let on_complete = self.on_complete.lock().unwrap().take();
        if let Some(cb) = on_complete {
            let _ = self.work_queue.queue_main_work_item(move || cb(pid, result));
        }
        Ok(())
    }
}

pub trait IAuth: Send + Sync {
    fn authenticate(&self, request: Arc<AuthRequest>);
}

/// Lets a billing module consult a local credential store while its
/// external billing connection is down (§4.6).
pub trait IBillingFallback: Send + Sync {
    fn check(&self, name: &str, password: &str) -> AuthResult;
}

/// A chaining authenticator: tries its own logic first, forwards anything
/// it doesn't handle to the authenticator captured at registration time
/// (§4.6 "reads the previously-registered `IAuth` reference ... forwards
/// unhandled requests to it").
pub struct ChainedAuth<F> {
    inner: F,
    fallback: Arc<dyn IAuth>,
}

impl<F> ChainedAuth<F>
where
    F: Fn(&Arc<AuthRequest>) -> bool + Send + Sync,
{
    pub fn new(fallback: Arc<dyn IAuth>, try_handle: F) -> Self {
        Self {
            inner: try_handle,
            fallback,
        }
    }
}

impl<F> IAuth for ChainedAuth<F>
where
    F: Fn(&Arc<AuthRequest>) -> bool + Send + Sync,
{
    fn authenticate(&self, request: Arc<AuthRequest>) {
        if !(self.inner)(&request) {
            self.fallback.authenticate(request);
        }
    }
}

/// Simple pool for `AuthRequest` allocations, matching `zone_net::pool`'s
/// RAII pattern. Not used by `ChainedAuth`/tests directly, but available
/// to `zone_server` so a login storm doesn't allocate a fresh `Arc` per
/// attempt.
#[derive(Default)]
pub struct AuthRequestPool {
    free: Mutex<Vec<Arc<AuthRequest>>>,
}

impl AuthRequestPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a request to the pool for reuse once its completion has
    /// been fully processed and no other references remain.
    pub fn recycle(&self, request: Arc<AuthRequest>) {
        if Arc::strong_count(&request) == 1 {
            self.free.lock().unwrap().push(request);
        } else {
            warn!("AuthRequest recycled while still referenced elsewhere, dropping instead");
        }
    }

    pub fn available(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct TerminalAuth;
    impl IAuth for TerminalAuth {
        fn authenticate(&self, request: Arc<AuthRequest>) {
            {
                let mut result = request.result.lock().unwrap();
                result.code = AuthCode::Ok;
                result.authenticated = true;
            }
            request.done().unwrap();
        }
    }

    /// E5 — auth chain fallback: `IAuth#1` defers every request to
    /// `IAuth#0`, captured at registration time.
    #[test]
    fn e5_chain_forwards_to_captured_fallback() {
        let queue = WorkQueue::new();
        let auth0: Arc<dyn IAuth> = Arc::new(TerminalAuth);
        let auth1 = ChainedAuth::new(auth0, |_req| false);

        let completed_code = Arc::new(Mutex::new(None));
        let c = completed_code.clone();
        let request = AuthRequest::new(
            1,
            b"alice\0pw\0".to_vec(),
            LoginPacketView {
                name: "alice".to_string(),
                password: "pw".to_string(),
            },
            Vec::new(),
            queue.clone(),
            move |_pid, result| {
                *c.lock().unwrap() = Some(result.code);
            },
        );

        auth1.authenticate(request);
        queue.drain();
        assert_eq!(*completed_code.lock().unwrap(), Some(AuthCode::Ok));
    }

    #[test]
    fn done_called_twice_is_rejected() {
        let queue = WorkQueue::new();
        let request = AuthRequest::new(1, Vec::new(), LoginPacketView::default(), Vec::new(), queue, |_, _| {});
        request.done().unwrap();
        assert!(request.done().is_err());
    }

    #[test]
    fn abandoned_request_done_is_a_noop_error() {
        let queue = WorkQueue::new();
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        let request = AuthRequest::new(1, Vec::new(), LoginPacketView::default(), Vec::new(), queue.clone(), move |_, _| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        request.abandon();
        assert!(request.done().is_err());
        queue.drain();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
