pub mod coordinator;

pub use coordinator::{
    power_domain_pre_off, syscore_suspend, CpuPmCoordinator, CpuPmEvent, PmVerdict, APPS_RSC,
};
