// Combines several zones that report the same logical domain (for
// instance `package` on each of two sockets) into one virtual zone.
// Member counters wrap independently at device-specific bounds, so the
// only correct way to aggregate is to accumulate per-member forward
// deltas; summing the raw readings would jump backwards whenever one
// member wraps.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::{Energy, EnergyZone, Power, ProbeError, Result};

/// A virtual zone over an ordered, non-empty set of members sharing a
/// name.
pub struct AggregateZone {
    name: String,
    path: String,
    members: Vec<Arc<dyn EnergyZone>>,
    /// Sum of the members' wrap bounds, saturated at `u64::MAX`.
    max_energy: Energy,
    state: Mutex<AggregateState>,
}

#[derive(Default)]
struct AggregateState {
    /// Most recent raw reading of each member, keyed by (name, index).
    last_readings: HashMap<(String, i32), u64>,
    /// Current aggregated energy, kept below `max_energy` when the
    /// bound is non-zero.
    accumulated: u64,
}

impl AggregateZone {
    /// Builds an aggregate over `members`. The aggregated name is taken
    /// from the first member; an empty member list is a programming
    /// error and fails construction.
    pub fn new(members: Vec<Arc<dyn EnergyZone>>) -> Result<AggregateZone> {
        let first = members
            .first()
            .ok_or_else(|| ProbeError::Init("aggregate zone requires at least one member".into()))?;
        let name = first.name().to_ascii_lowercase();
        let max_energy = members
            .iter()
            .fold(Energy::ZERO, |acc, m| acc.saturating_add(m.max_energy()));
        Ok(AggregateZone {
            path: format!("aggregated-{name}"),
            name,
            members,
            max_energy,
            state: Mutex::new(AggregateState::default()),
        })
    }
}

impl EnergyZone for AggregateZone {
    fn name(&self) -> &str {
        &self.name
    }

    fn index(&self) -> i32 {
        -1
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn max_energy(&self) -> Energy {
        self.max_energy
    }

    /// Reads every member and folds the forward deltas into the running
    /// total. Fails atomically: if any member read fails, no internal
    /// state is updated.
    fn energy(&self) -> Result<Energy> {
        let mut state = self.state.lock().unwrap();

        // Read all members up front so a late failure cannot leave the
        // bookkeeping half-updated.
        let mut readings = Vec::with_capacity(self.members.len());
        for member in &self.members {
            let reading = member
                .energy()
                .map_err(|e| ProbeError::for_zone(format!("{}-{}", member.name(), member.index()), e))?;
            readings.push((member, reading.micro_joules()));
        }

        let mut delta_sum: u64 = 0;
        for (member, reading) in readings {
            let key = (member.name().to_string(), member.index());
            let delta = match state.last_readings.get(&key) {
                // First pass: the reading itself seeds the total.
                None => reading,
                Some(&previous) if reading >= previous => reading - previous,
                Some(&previous) => {
                    let member_max = member.max_energy().micro_joules();
                    if member_max > 0 {
                        // The counter wrapped at the member's bound.
                        member_max.saturating_sub(previous).wrapping_add(reading)
                    } else {
                        // No declared bound: unsigned wrap-around.
                        reading.wrapping_sub(previous)
                    }
                }
            };
            delta_sum = delta_sum.saturating_add(delta);
            state.last_readings.insert(key, reading);
        }

        state.accumulated = state.accumulated.wrapping_add(delta_sum);
        let max = self.max_energy.micro_joules();
        if max > 0 {
            state.accumulated %= max;
        }
        Ok(Energy::from_micro_joules(state.accumulated))
    }

    /// Sum of the members' instantaneous power. Only meaningful for
    /// groups of power-capable zones; a member without power support
    /// fails the whole read.
    fn power(&self) -> Result<Power> {
        let mut total = Power::ZERO;
        for member in &self.members {
            let p = member
                .power()
                .map_err(|e| ProbeError::for_zone(format!("{}-{}", member.name(), member.index()), e))?;
            total = total + p;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted zone: pops one reading per energy() call.
    struct ScriptedZone {
        name: String,
        index: i32,
        path: String,
        max_energy: Energy,
        readings: Mutex<VecDeque<Result<u64>>>,
    }

    impl ScriptedZone {
        fn new(name: &str, index: i32, max_energy: u64, readings: Vec<Result<u64>>) -> ScriptedZone {
            ScriptedZone {
                name: name.to_string(),
                index,
                path: format!("scripted-{name}-{index}"),
                max_energy: Energy::from_micro_joules(max_energy),
                readings: Mutex::new(readings.into_iter().collect()),
            }
        }
    }

    impl EnergyZone for ScriptedZone {
        fn name(&self) -> &str {
            &self.name
        }
        fn index(&self) -> i32 {
            self.index
        }
        fn path(&self) -> &str {
            &self.path
        }
        fn max_energy(&self) -> Energy {
            self.max_energy
        }
        fn energy(&self) -> Result<Energy> {
            self.readings
                .lock()
                .unwrap()
                .pop_front()
                .expect("scripted zone ran out of readings")
                .map(Energy::from_micro_joules)
        }
        fn power(&self) -> Result<Power> {
            Err(ProbeError::Unsupported(format!("power on {}", self.name)))
        }
    }

    fn read_error() -> ProbeError {
        ProbeError::read("scripted", std::io::Error::from(std::io::ErrorKind::Other))
    }

    #[test]
    fn empty_member_list_fails_construction() {
        assert!(matches!(
            AggregateZone::new(Vec::new()),
            Err(ProbeError::Init(_))
        ));
    }

    #[test]
    fn identity_of_aggregate() {
        let member: Arc<dyn EnergyZone> =
            Arc::new(ScriptedZone::new("package", 0, 1000, vec![]));
        let agg = AggregateZone::new(vec![member]).unwrap();
        assert_eq!(agg.name(), "package");
        assert_eq!(agg.index(), -1);
        assert_eq!(agg.path(), "aggregated-package");
        assert_eq!(agg.max_energy().micro_joules(), 1000);
    }

    #[test]
    fn max_energy_saturates() {
        let members: Vec<Arc<dyn EnergyZone>> = vec![
            Arc::new(ScriptedZone::new("package", 0, u64::MAX, vec![])),
            Arc::new(ScriptedZone::new("package", 1, 1000, vec![])),
        ];
        let agg = AggregateZone::new(members).unwrap();
        assert_eq!(agg.max_energy(), Energy::MAX);
    }

    #[test]
    fn single_member_with_wraps() {
        // Readings 900, 100, 50, 900 on a counter wrapping at 1000.
        // Seed pass reports 900; 900->100 wraps for a delta of 200;
        // 100->50 wraps for a delta of 950; 50->900 advances by 850.
        let member: Arc<dyn EnergyZone> = Arc::new(ScriptedZone::new(
            "package",
            0,
            1000,
            vec![Ok(900), Ok(100), Ok(50), Ok(900)],
        ));
        let agg = AggregateZone::new(vec![member]).unwrap();
        assert_eq!(agg.energy().unwrap().micro_joules(), 900);
        assert_eq!(agg.energy().unwrap().micro_joules(), 100);
        assert_eq!(agg.energy().unwrap().micro_joules(), 50);
        assert_eq!(agg.energy().unwrap().micro_joules(), 900);
    }

    #[test]
    fn two_members_one_wrapping() {
        let members: Vec<Arc<dyn EnergyZone>> = vec![
            Arc::new(ScriptedZone::new("package", 0, 1000, vec![Ok(900), Ok(100)])),
            Arc::new(ScriptedZone::new("package", 1, 1000, vec![Ok(800), Ok(850)])),
        ];
        let agg = AggregateZone::new(members).unwrap();
        assert_eq!(agg.max_energy().micro_joules(), 2000);
        // Seed pass: 900 + 800.
        assert_eq!(agg.energy().unwrap().micro_joules(), 1700);
        // Member 0 wrapped: (1000-900)+100 = 200; member 1 advanced 50.
        assert_eq!(agg.energy().unwrap().micro_joules(), 1950);
    }

    #[test]
    fn accumulated_stays_below_bound() {
        let member: Arc<dyn EnergyZone> = Arc::new(ScriptedZone::new(
            "package",
            0,
            1000,
            vec![Ok(600), Ok(900), Ok(400)],
        ));
        let agg = AggregateZone::new(vec![member]).unwrap();
        for _ in 0..3 {
            let e = agg.energy().unwrap().micro_joules();
            assert!(e < 1000, "aggregated energy {e} must stay below the bound");
        }
    }

    #[test]
    fn unbounded_member_uses_unsigned_wraparound() {
        // max_energy == 0 means "no declared bound": a backwards step
        // is treated as u64 wrap-around arithmetic.
        let member: Arc<dyn EnergyZone> = Arc::new(ScriptedZone::new(
            "platform",
            0,
            0,
            vec![Ok(100), Ok(40)],
        ));
        let agg = AggregateZone::new(vec![member]).unwrap();
        assert_eq!(agg.energy().unwrap().micro_joules(), 100);
        // 40 - 100 in wrapping u64 arithmetic
        let expected = 100u64.wrapping_add(40u64.wrapping_sub(100));
        assert_eq!(agg.energy().unwrap().micro_joules(), expected);
    }

    #[test]
    fn member_failure_is_atomic() {
        let failing: Arc<dyn EnergyZone> = Arc::new(ScriptedZone::new(
            "package",
            1,
            1000,
            vec![Ok(100), Err(read_error()), Ok(150)],
        ));
        let healthy: Arc<dyn EnergyZone> = Arc::new(ScriptedZone::new(
            "package",
            0,
            1000,
            vec![Ok(500), Ok(700), Ok(700)],
        ));
        let agg = AggregateZone::new(vec![healthy, failing]).unwrap();
        assert_eq!(agg.energy().unwrap().micro_joules(), 600);

        // The failing pass must identify the member and leave state untouched.
        let err = agg.energy().unwrap_err();
        match err {
            ProbeError::Zone { zone, .. } => assert_eq!(zone, "package-1"),
            other => panic!("expected zone error, got {other}"),
        }

        // Healthy member moved 500->700 on the failed pass. Because the
        // pass aborted before recording anything, the next successful
        // pass sees 500->700 (delta 200) and 100->150 (delta 50).
        assert_eq!(agg.energy().unwrap().micro_joules(), 850);
    }
}
