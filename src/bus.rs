//! Summing buses, the master dynamics chain and per-bus output routes.

use crate::config::taps;
use crate::dsp::StageKind;
use crate::ramp::ParamHandle;
use crate::tap::AnalysisTap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BusId {
    Master,
    Aux1,
    Aux2,
}

impl BusId {
    pub const ALL: [BusId; 3] = [BusId::Master, BusId::Aux1, BusId::Aux2];

    pub fn index(self) -> usize {
        match self {
            BusId::Master => 0,
            BusId::Aux1 => 1,
            BusId::Aux2 => 2,
        }
    }

    /// Position in a channel's aux send array; `None` for MASTER.
    pub fn aux_index(self) -> Option<usize> {
        match self {
            BusId::Master => None,
            BusId::Aux1 => Some(0),
            BusId::Aux2 => Some(1),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BusId::Master => "MASTER",
            BusId::Aux1 => "AUX1",
            BusId::Aux2 => "AUX2",
        }
    }

    fn tap_size(self) -> usize {
        match self {
            BusId::Master => taps::MASTER_TAP_FRAMES,
            _ => taps::AUX_TAP_FRAMES,
        }
    }
}

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BusId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MASTER" | "PGM" => Ok(BusId::Master),
            "AUX1" | "AUX" => Ok(BusId::Aux1),
            "AUX2" => Ok(BusId::Aux2),
            other => Err(format!("unknown bus '{}'", other)),
        }
    }
}

/// Compressor/limiter switches for the MASTER path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicsChain {
    pub compressor_enabled: bool,
    pub limiter_enabled: bool,
}

impl DynamicsChain {
    pub fn new(compressor_enabled: bool, limiter_enabled: bool) -> Self {
        DynamicsChain {
            compressor_enabled,
            limiter_enabled,
        }
    }

    /// Enabled stages in signal order: compressor always precedes limiter.
    pub fn layout(&self) -> Vec<StageKind> {
        let mut stages = Vec::with_capacity(2);
        if self.compressor_enabled {
            stages.push(StageKind::Compressor);
        }
        if self.limiter_enabled {
            stages.push(StageKind::Limiter);
        }
        stages
    }
}

/// Physical output binding for a bus. `None` follows the system default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRoute {
    pub device: Option<String>,
}

impl OutputRoute {
    pub fn new(device: Option<String>) -> Self {
        OutputRoute {
            device: normalize_device(device),
        }
    }

    pub fn label(&self) -> &str {
        self.device.as_deref().unwrap_or("default")
    }
}

/// `"default"` and empty names both mean the system default device.
pub fn normalize_device(device: Option<String>) -> Option<String> {
    device.filter(|d| !d.is_empty() && !d.eq_ignore_ascii_case("default"))
}

/// Shared handles the renderer reads for one bus.
#[derive(Clone)]
pub struct BusHandles {
    pub level: ParamHandle,
    pub tap: AnalysisTap,
}

/// Control-side state of one bus.
pub struct Bus {
    pub id: BusId,
    level: f32,
    handles: BusHandles,
    /// Present on MASTER only.
    dynamics: Option<DynamicsChain>,
    route: OutputRoute,
}

impl Bus {
    pub fn new(id: BusId, level: f32, time_constant: f32, route: OutputRoute) -> Self {
        let level = level.clamp(0.0, crate::config::ranges::BUS_LEVEL_MAX);
        Bus {
            id,
            level,
            handles: BusHandles {
                level: ParamHandle::new(level, time_constant),
                tap: AnalysisTap::new(id.tap_size()),
            },
            dynamics: None,
            route,
        }
    }

    pub fn with_dynamics(mut self, dynamics: DynamicsChain) -> Self {
        self.dynamics = Some(dynamics);
        self
    }

    pub fn handles(&self) -> &BusHandles {
        &self.handles
    }

    pub fn tap(&self) -> &AnalysisTap {
        &self.handles.tap
    }

    pub fn level(&self) -> f32 {
        self.level
    }

    /// Store and ramp toward a new output level, clamped to [0, 1].
    pub fn set_level(&mut self, level: f32, tau: f32) -> f32 {
        self.level = level.clamp(0.0, crate::config::ranges::BUS_LEVEL_MAX);
        self.handles.level.set_target(self.level, tau);
        self.level
    }

    pub fn dynamics(&self) -> Option<DynamicsChain> {
        self.dynamics
    }

    pub fn dynamics_mut(&mut self) -> Option<&mut DynamicsChain> {
        self.dynamics.as_mut()
    }

    pub fn route(&self) -> &OutputRoute {
        &self.route
    }

    pub fn set_route(&mut self, route: OutputRoute) {
        self.route = route;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_ids_print_uppercase() {
        assert_eq!(BusId::Master.to_string(), "MASTER");
        assert_eq!(BusId::Aux2.to_string(), "AUX2");
        assert_eq!("aux1".parse::<BusId>().unwrap(), BusId::Aux1);
        assert!("aux3".parse::<BusId>().is_err());
    }

    #[test]
    fn only_aux_buses_have_send_slots() {
        assert_eq!(BusId::Master.aux_index(), None);
        assert_eq!(BusId::Aux1.aux_index(), Some(0));
        assert_eq!(BusId::Aux2.aux_index(), Some(1));
    }

    #[test]
    fn layout_keeps_compressor_before_limiter() {
        assert_eq!(
            DynamicsChain::new(true, true).layout(),
            vec![StageKind::Compressor, StageKind::Limiter]
        );
        assert_eq!(DynamicsChain::new(false, true).layout(), vec![StageKind::Limiter]);
        assert!(DynamicsChain::new(false, false).layout().is_empty());
    }

    #[test]
    fn default_route_names() {
        assert_eq!(OutputRoute::default().label(), "default");
        assert_eq!(OutputRoute::new(Some("default".into())).device, None);
        assert_eq!(OutputRoute::new(Some("Headphones".into())).label(), "Headphones");
    }

    #[test]
    fn level_is_clamped() {
        let mut bus = Bus::new(BusId::Aux1, 2.0, 0.05, OutputRoute::default());
        assert_eq!(bus.level(), 1.0);
        assert_eq!(bus.set_level(-1.0, 0.05), 0.0);
        assert_eq!(bus.handles().level.target(), 0.0);
    }

    #[test]
    fn master_tap_is_larger() {
        let master = Bus::new(BusId::Master, 0.8, 0.05, OutputRoute::default());
        let aux = Bus::new(BusId::Aux1, 1.0, 0.05, OutputRoute::default());
        assert_eq!(master.tap().size(), taps::MASTER_TAP_FRAMES);
        assert_eq!(aux.tap().size(), taps::AUX_TAP_FRAMES);
        assert!(master.dynamics().is_none());
    }
}
