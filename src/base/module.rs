use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, TryLockError};
use crate::base::behavior::*;

/// State and configuration shared by every hardware-facing module.
///
/// Modules are called from several CPU threads and from interrupt context, so the mutable state
/// always sits behind the module lock. The configuration is set once at probe time.
#[derive(Debug)]
pub struct ModuleBase<T, C> {
    pub state: Mutex<T>,
    pub config: OnceLock<Arc<C>>,
}

impl<T: Default, C> Default for ModuleBase<T, C> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T, C> ModuleBase<T, C> {
    pub fn new(state: T) -> Self {
        Self {
            state: Mutex::new(state),
            config: OnceLock::new(),
        }
    }

    /// Acquire the module lock, recovering a poisoned one.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Non-blocking acquire; `None` means somebody else holds the lock right now.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        match self.state.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

pub trait IsModule {
    type StateType;
    type ConfigType;

    fn base_ref(&self) -> &ModuleBase<Self::StateType, Self::ConfigType>;

    fn state(&self) -> MutexGuard<'_, Self::StateType> {
        self.base_ref().lock()
    }
}

impl<X> Parameterizable for X where X: IsModule {
    type ConfigType = X::ConfigType;

    fn conf(&self) -> &Self::ConfigType {
        self.base_ref().config.get().expect("config not found, was `init_conf` called in `new`?")
    }

    fn init_conf(&self, conf: Arc<Self::ConfigType>) {
        if self.base_ref().config.set(conf).is_err() {
            log::warn!("module config already set, keeping the first one");
        }
    }
}

/// arguments: identifier, state type, config type, additional methods
macro_rules! module {
    ($comp:ident, $T:ty, $C:ty, $($method:item)*) => {
        impl IsModule for $comp {
            type StateType = $T;
            type ConfigType = $C;

            fn base_ref(&self) -> &ModuleBase<$T, $C> {
                &self.base
            }

            $($method)*
        }
    };
}

pub(crate) use module;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        base: ModuleBase<u32, u8>,
    }

    module!(Counter, u32, u8,);

    #[test]
    fn try_lock_fails_while_held() {
        let counter = Counter::default();
        let guard = counter.state();
        assert!(counter.base_ref().try_lock().is_none());
        drop(guard);
        assert!(counter.base_ref().try_lock().is_some());
    }

    #[test]
    fn config_is_set_once() {
        let counter = Counter::default();
        counter.init_conf(Arc::new(3));
        counter.init_conf(Arc::new(7));
        assert_eq!(3, *counter.conf());
    }
}
