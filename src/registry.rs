use std::sync::Arc;

use crate::rpmh::client::RpmhClient;
use crate::rsc::controller::Controller;
use crate::rsc::error::RscError;

/// Most RSC DRVs one system carries.
pub const MAX_RSC_COUNT: usize = 2;

/// The controllers probed at startup, looked up by name.
#[derive(Default)]
pub struct RscRegistry {
    drvs: Vec<Arc<Controller>>,
}

impl RscRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, drv: Arc<Controller>) -> Result<usize, RscError> {
        if self.drvs.len() >= MAX_RSC_COUNT {
            return Err(RscError::RegistryFull);
        }
        if self.get(drv.name()).is_some() {
            return Err(RscError::InvalidTopology(format!("{} registered twice", drv.name())));
        }
        self.drvs.push(drv);
        Ok(self.drvs.len() - 1)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Controller>> {
        self.drvs.iter().find(|drv| drv.name() == name).cloned()
    }

    pub fn client(&self, name: &str) -> Option<RpmhClient> {
        self.get(name).map(RpmhClient::new)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Controller>> {
        self.drvs.iter()
    }

    pub fn len(&self) -> usize {
        self.drvs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drvs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rsc::config::RscConfig;
    use crate::sim::hw::{SimHwConfig, SimRsc};

    fn bring_up(name: &str) -> Arc<Controller> {
        let conf = RscConfig { name: name.to_string(), ..RscConfig::default() };
        let sim = SimRsc::new(conf.tcs_offset, conf.drv_id, SimHwConfig::manual());
        Controller::probe(conf, sim).unwrap()
    }

    #[test]
    fn lookup_by_name() {
        let mut registry = RscRegistry::new();
        assert_eq!(Ok(0), registry.register(bring_up("apps_rsc")));
        assert_eq!(Ok(1), registry.register(bring_up("disp_rsc")));
        assert_eq!("disp_rsc", registry.get("disp_rsc").unwrap().name());
        assert!(registry.get("cam_rsc").is_none());
        assert!(registry.client("apps_rsc").is_some());
        assert_eq!(2, registry.iter().count());
    }

    #[test]
    fn capacity_and_duplicates() {
        let mut registry = RscRegistry::new();
        registry.register(bring_up("apps_rsc")).unwrap();
        assert!(registry.register(bring_up("apps_rsc")).is_err());
        registry.register(bring_up("disp_rsc")).unwrap();
        assert_eq!(Err(RscError::RegistryFull), registry.register(bring_up("cam_rsc")));
    }
}
