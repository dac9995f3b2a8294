use std::sync::Arc;

pub trait ModuleBehaviors {
    /// Return the module to its post-probe state.
    fn reset(&mut self);
}

pub trait Parameterizable {
    type ConfigType;

    fn conf(&self) -> &Self::ConfigType;

    fn init_conf(&self, conf: Arc<Self::ConfigType>);
}
