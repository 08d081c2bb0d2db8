//! Host driver hooks.
//!
//! The simulator calls back into the host for two things: raising the hot-plug interrupt after
//! a topology or bandwidth change, and giving the host a chance to rewrite a synthesized reply
//! (fault injection). Both are optional.
//!
//! Callbacks run synchronously while the simulator's state lock is held. Calling back into the
//! same [`crate::Simulator`] from a callback fails with [`crate::SimError::InvalidState`].

/// Host side of the simulated branch.
pub trait HostBridge: Send {
    /// The branch raised an HPD IRQ pulse.
    fn notify_hpd_irq(&mut self) {}

    /// Inspect or replace the encoded reply chunks for `request` before they reach the caller.
    ///
    /// `request` holds every chunk of the reassembled request back to back, exactly as
    /// received; `reply` holds the encoded reply chunks the same way.
    fn override_reply(&mut self, request: &[u8], reply: &mut Vec<u8>) {
        let _ = (request, reply);
    }
}

impl<T: HostBridge + ?Sized> HostBridge for Box<T> {
    fn notify_hpd_irq(&mut self) {
        <T as HostBridge>::notify_hpd_irq(&mut **self);
    }

    fn override_reply(&mut self, request: &[u8], reply: &mut Vec<u8>) {
        <T as HostBridge>::override_reply(&mut **self, request, reply);
    }
}

impl HostBridge for () {}

impl<B: HostBridge> HostBridge for Option<B> {
    fn notify_hpd_irq(&mut self) {
        if let Some(host) = self.as_mut() {
            host.notify_hpd_irq();
        }
    }

    fn override_reply(&mut self, request: &[u8], reply: &mut Vec<u8>) {
        if let Some(host) = self.as_mut() {
            host.override_reply(request, reply);
        }
    }
}

impl<T: HostBridge + ?Sized> HostBridge for std::sync::Arc<std::sync::Mutex<T>> {
    fn notify_hpd_irq(&mut self) {
        self.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .notify_hpd_irq();
    }

    fn override_reply(&mut self, request: &[u8], reply: &mut Vec<u8>) {
        self.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .override_reply(request, reply);
    }
}

type HpdFn<D> = Box<dyn FnMut(&mut D) + Send>;
type OverrideFn<D> = Box<dyn FnMut(&mut D, &[u8], &mut Vec<u8>) + Send>;

/// Closure-based [`HostBridge`] carrying an opaque host device value.
///
/// Mirrors the C-style "device pointer plus optional function pointers" registration that
/// kernel glue uses.
pub struct HostCallbacks<D> {
    device: D,
    on_hpd_irq: Option<HpdFn<D>>,
    on_override_reply: Option<OverrideFn<D>>,
}

impl<D> HostCallbacks<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            on_hpd_irq: None,
            on_override_reply: None,
        }
    }

    pub fn on_hpd_irq(mut self, f: impl FnMut(&mut D) + Send + 'static) -> Self {
        self.on_hpd_irq = Some(Box::new(f));
        self
    }

    pub fn on_override_reply(
        mut self,
        f: impl FnMut(&mut D, &[u8], &mut Vec<u8>) + Send + 'static,
    ) -> Self {
        self.on_override_reply = Some(Box::new(f));
        self
    }

    pub fn device(&self) -> &D {
        &self.device
    }
}

impl<D: Send> HostBridge for HostCallbacks<D> {
    fn notify_hpd_irq(&mut self) {
        if let Some(f) = self.on_hpd_irq.as_mut() {
            f(&mut self.device);
        }
    }

    fn override_reply(&mut self, request: &[u8], reply: &mut Vec<u8>) {
        if let Some(f) = self.on_override_reply.as_mut() {
            f(&mut self.device, request, reply);
        }
    }
}

impl<D: core::fmt::Debug> core::fmt::Debug for HostCallbacks<D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HostCallbacks")
            .field("device", &self.device)
            .field("on_hpd_irq", &self.on_hpd_irq.is_some())
            .field("on_override_reply", &self.on_override_reply.is_some())
            .finish()
    }
}
