use serde::Serialize;

use crate::config::PowerConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct AllocationRequest {
    pub device_id: String,
    /// Present draw from the device's power sensor, 0 when absent.
    pub draw_w: f64,
    pub max_increment_w: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    pub device_id: String,
    pub increment_w: f64,
    /// Target draw (present draw plus increment); `None` when nothing was
    /// allocated and the device should idle.
    pub budget_w: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationOutcome {
    pub surplus_w: f64,
    pub remaining_w: f64,
    pub allocations: Vec<Allocation>,
}

impl AllocationOutcome {
    pub fn allocated_w(&self) -> f64 {
        self.allocations.iter().map(|a| a.increment_w).sum()
    }

    pub fn budget_for(&self, device_id: &str) -> Option<f64> {
        self.allocations
            .iter()
            .find(|allocation| allocation.device_id == device_id)
            .and_then(|allocation| allocation.budget_w)
    }
}

/// Export available for heating. Net power is negative while exporting.
pub fn surplus_w(net_power_w: f64, reserve_w: f64) -> f64 {
    if !net_power_w.is_finite() {
        return 0.0;
    }
    (-net_power_w - reserve_w.max(0.0)).max(0.0)
}

/// Hands out `surplus_w` in request order. Each device takes at most its
/// increment ceiling; once a share would fall below `min_budget_w`, that
/// device and every one after it gets nothing.
pub fn allocate(
    requests: &[AllocationRequest],
    surplus_w: f64,
    min_budget_w: f64,
) -> AllocationOutcome {
    let surplus_w = if surplus_w.is_finite() {
        surplus_w.max(0.0)
    } else {
        0.0
    };
    let mut remaining = surplus_w;
    let mut exhausted = false;

    let allocations = requests
        .iter()
        .map(|request| {
            let ceiling = if request.max_increment_w.is_finite() {
                request.max_increment_w.max(0.0)
            } else {
                0.0
            };
            let share = remaining.min(ceiling);
            let increment_w = if exhausted || share <= 0.0 || share < min_budget_w {
                exhausted = true;
                0.0
            } else {
                share
            };
            remaining -= increment_w;

            let draw_w = if request.draw_w.is_finite() {
                request.draw_w.max(0.0)
            } else {
                0.0
            };
            Allocation {
                device_id: request.device_id.clone(),
                increment_w,
                budget_w: (increment_w > 0.0).then_some(draw_w + increment_w),
            }
        })
        .collect();

    AllocationOutcome {
        surplus_w,
        remaining_w: remaining,
        allocations,
    }
}

/// Walks a device setpoint toward its power budget in fixed steps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PowerStepper {
    setpoint: Option<f64>,
    last_adjust_ms: Option<u64>,
}

impl PowerStepper {
    pub fn setpoint(&self) -> Option<f64> {
        self.setpoint
    }

    /// Next requested setpoint. `seed` is used the first time the device
    /// enters power mode. Without a draw reading the setpoint holds.
    pub fn next(
        &mut self,
        budget_w: f64,
        draw_w: Option<f64>,
        seed: f64,
        config: &PowerConfig,
        now_ms: u64,
    ) -> f64 {
        let current = *self.setpoint.get_or_insert(seed);
        let due = self
            .last_adjust_ms
            .map(|last| now_ms.saturating_sub(last) >= config.adjust_interval_ms)
            .unwrap_or(true);
        if !due {
            return current;
        }
        self.last_adjust_ms = Some(now_ms);

        let Some(draw_w) = draw_w.filter(|value| value.is_finite()) else {
            return current;
        };
        if budget_w <= 0.0 || !budget_w.is_finite() {
            return current;
        }

        let error_pct = (budget_w - draw_w) / budget_w * 100.0;
        let next = if error_pct.abs() <= config.deadband_pct {
            current
        } else if error_pct > 0.0 {
            current + config.step_c
        } else {
            current - config.step_c
        };
        self.setpoint = Some(next);
        next
    }

    /// Stores the value actually commanded after clamping so the stepper
    /// never winds up past the limits.
    pub fn settle(&mut self, commanded: f64) {
        self.setpoint = Some(commanded);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn request(device_id: &str, draw_w: f64, max_increment_w: f64) -> AllocationRequest {
        AllocationRequest {
            device_id: device_id.to_string(),
            draw_w,
            max_increment_w,
        }
    }

    #[test]
    fn allocates_in_priority_order() {
        let requests = [
            request("primary", 0.0, 1_000.0),
            request("assist", 400.0, 800.0),
            request("spare", 0.0, 800.0),
        ];

        let outcome = allocate(&requests, 1_500.0, 200.0);

        assert_eq!(
            outcome.allocations,
            vec![
                Allocation {
                    device_id: "primary".to_string(),
                    increment_w: 1_000.0,
                    budget_w: Some(1_000.0),
                },
                Allocation {
                    device_id: "assist".to_string(),
                    increment_w: 500.0,
                    budget_w: Some(900.0),
                },
                Allocation {
                    device_id: "spare".to_string(),
                    increment_w: 0.0,
                    budget_w: None,
                },
            ]
        );
        assert_eq!(outcome.remaining_w, 0.0);
        assert_eq!(outcome.allocated_w(), 1_500.0);
    }

    #[test]
    fn share_below_minimum_stops_the_walk() {
        let requests = [
            request("primary", 0.0, 1_200.0),
            request("assist", 0.0, 1_200.0),
            request("spare", 0.0, 50.0),
        ];

        let outcome = allocate(&requests, 1_350.0, 200.0);

        assert_eq!(outcome.budget_for("primary"), Some(1_200.0));
        assert_eq!(outcome.budget_for("assist"), None);
        assert_eq!(outcome.budget_for("spare"), None);
        assert_eq!(outcome.remaining_w, 150.0);
    }

    #[test]
    fn no_export_means_no_budget() {
        assert_eq!(surplus_w(250.0, 300.0), 0.0);
        assert_eq!(surplus_w(-250.0, 300.0), 0.0);
        assert_eq!(surplus_w(-1_800.0, 300.0), 1_500.0);
        assert_eq!(surplus_w(f64::NAN, 0.0), 0.0);

        let outcome = allocate(&[request("primary", 0.0, 1_200.0)], f64::NAN, 200.0);
        assert_eq!(outcome.budget_for("primary"), None);
    }

    #[test]
    fn stepper_moves_toward_budget_and_respects_interval() {
        let config = PowerConfig::default();
        let mut stepper = PowerStepper::default();

        let first = stepper.next(1_000.0, Some(200.0), 21.0, &config, 0);
        assert!((first - 21.3).abs() < 1e-9);

        // Not due yet.
        assert_eq!(stepper.next(1_000.0, Some(200.0), 21.0, &config, 30_000), first);

        let second = stepper.next(1_000.0, Some(1_600.0), 21.0, &config, 90_000);
        assert!((second - 21.0).abs() < 1e-9);
    }

    #[test]
    fn stepper_holds_inside_deadband_or_without_draw() {
        let config = PowerConfig::default();
        let mut stepper = PowerStepper::default();

        assert_eq!(stepper.next(1_000.0, Some(900.0), 22.0, &config, 0), 22.0);
        assert_eq!(stepper.next(1_000.0, None, 25.0, &config, 90_000), 22.0);

        stepper.settle(30.0);
        assert_eq!(stepper.setpoint(), Some(30.0));

        stepper.reset();
        assert_eq!(stepper.setpoint(), None);
    }
}
