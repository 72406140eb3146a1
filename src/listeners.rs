//! Handler registries with drop-to-unsubscribe handles.

use std::{
   collections::BTreeMap,
   fmt,
   sync::{
      Arc,
      atomic::{AtomicU64, Ordering},
   },
};

use parking_lot::Mutex;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A set of callbacks notified in registration order.
pub struct Listeners<T> {
   next_id:  AtomicU64,
   handlers: Arc<Mutex<BTreeMap<u64, Handler<T>>>>,
}

impl<T> Default for Listeners<T> {
   fn default() -> Self {
      Self { next_id: AtomicU64::new(0), handlers: Arc::new(Mutex::new(BTreeMap::new())) }
   }
}

impl<T: 'static> Listeners<T> {
   pub fn new() -> Self {
      Self::default()
   }

   /// Registers `handler`; it stays registered until the returned
   /// [`Subscription`] is dropped or unsubscribed.
   pub fn subscribe(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
      let id = self.next_id.fetch_add(1, Ordering::Relaxed);
      self.handlers.lock().insert(id, Arc::new(handler));

      let handlers = Arc::downgrade(&self.handlers);
      Subscription::new(move || {
         if let Some(handlers) = handlers.upgrade() {
            handlers.lock().remove(&id);
         }
      })
   }

   pub fn emit(&self, value: &T) {
      // Handlers run outside the lock so they may subscribe or unsubscribe.
      let handlers: Vec<Handler<T>> = self.handlers.lock().values().cloned().collect();
      for handler in handlers {
         handler(value);
      }
   }

   pub fn clear(&self) {
      self.handlers.lock().clear();
   }

   pub fn len(&self) -> usize {
      self.handlers.lock().len()
   }

   pub fn is_empty(&self) -> bool {
      self.len() == 0
   }
}

/// Unsubscribes its handler when dropped.
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
   cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
   pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
      Self { cancel: Some(Box::new(cancel)) }
   }

   /// A subscription that owns nothing.
   pub fn empty() -> Self {
      Self { cancel: None }
   }

   pub fn unsubscribe(mut self) {
      self.cancel_now();
   }

   fn cancel_now(&mut self) {
      if let Some(cancel) = self.cancel.take() {
         cancel();
      }
   }
}

impl Drop for Subscription {
   fn drop(&mut self) {
      self.cancel_now();
   }
}

impl fmt::Debug for Subscription {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Subscription")
         .field("active", &self.cancel.is_some())
         .finish()
   }
}
