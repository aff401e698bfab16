use serde::{Deserialize, Serialize};

use crate::{config::GlobalConfig, types::HvacMode};

/// Named trigger that keeps a condition timer running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssistCondition {
    EtaHigh,
    WaterHot,
    StalledBelowTarget,
    EtaLow,
    Overshoot,
    StalledAtTarget,
}

impl AssistCondition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EtaHigh => "eta_high",
            Self::WaterHot => "water_hot",
            Self::StalledBelowTarget => "stalled_below_target",
            Self::EtaLow => "eta_low",
            Self::Overshoot => "overshoot",
            Self::StalledAtTarget => "stalled_at_target",
        }
    }

    pub fn target_mode(self) -> HvacMode {
        match self {
            Self::EtaHigh | Self::WaterHot | Self::StalledBelowTarget => HvacMode::Heat,
            Self::EtaLow | Self::Overshoot | Self::StalledAtTarget => HvacMode::Off,
        }
    }
}

/// Room-level readings the triggers are evaluated against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConditionInputs {
    pub room_temperature: Option<f64>,
    pub target: f64,
    pub room_derivative: Option<f64>,
    pub room_eta_minutes: Option<f64>,
    pub water_temperature: Option<f64>,
}

pub fn on_condition(inputs: &ConditionInputs, config: &GlobalConfig) -> Option<AssistCondition> {
    let room = inputs.room_temperature?;
    if room >= inputs.target {
        return None;
    }
    let far_below = room < inputs.target - config.stall_delta_c;

    if inputs
        .room_eta_minutes
        .is_some_and(|eta| eta > config.on_eta_threshold_min)
    {
        return Some(AssistCondition::EtaHigh);
    }

    if inputs
        .water_temperature
        .is_some_and(|water| water >= config.water_on_threshold_c)
    {
        return Some(AssistCondition::WaterHot);
    }

    // A flat or falling room never reaches the target, so its undefined ETA
    // still asks for help once the room is clear of the stall band.
    if inputs
        .room_derivative
        .is_some_and(|derivative| derivative <= 0.0)
        && far_below
    {
        return Some(AssistCondition::StalledBelowTarget);
    }

    None
}

pub fn off_condition(inputs: &ConditionInputs, config: &GlobalConfig) -> Option<AssistCondition> {
    let room = inputs.room_temperature?;

    if inputs
        .room_eta_minutes
        .is_some_and(|eta| eta < config.off_eta_threshold_min)
    {
        return Some(AssistCondition::EtaLow);
    }

    if room >= inputs.target {
        return Some(AssistCondition::Overshoot);
    }

    if inputs
        .room_derivative
        .is_some_and(|derivative| derivative <= 0.0)
        && inputs.target - room <= config.stall_delta_c
    {
        return Some(AssistCondition::StalledAtTarget);
    }

    None
}

/// A transition held back by the anti-short-cycle guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardBlock {
    pub to: HvacMode,
    pub remaining_ms: u64,
}

impl GuardBlock {
    pub fn describe(&self) -> String {
        let dwell = match self.to {
            HvacMode::Heat => "min_off",
            HvacMode::Off => "min_on",
        };
        format!("{dwell} {}s", self.remaining_ms.div_ceil(1_000))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssistDecision {
    Hold,
    Transition {
        to: HvacMode,
        reason: AssistCondition,
    },
    Blocked {
        reason: AssistCondition,
        block: GuardBlock,
    },
}

/// Condition timers and dwell bookkeeping of one assist device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssistTimers {
    pub on_condition_ms: u64,
    pub off_condition_ms: u64,
    pub last_transition_ms: Option<u64>,
    pub active_condition: Option<AssistCondition>,
}

impl AssistTimers {
    /// Accumulates `elapsed_ms` on the timer of whichever trigger set holds.
    /// ON wins when both hold; neither resets both.
    pub fn advance(
        &mut self,
        inputs: &ConditionInputs,
        config: &GlobalConfig,
        elapsed_ms: u64,
    ) -> Option<AssistCondition> {
        let cap = config.condition_timer_cap_ms();

        if let Some(condition) = on_condition(inputs, config) {
            self.on_condition_ms = self.on_condition_ms.saturating_add(elapsed_ms).min(cap);
            self.off_condition_ms = 0;
            self.active_condition = Some(condition);
        } else if let Some(condition) = off_condition(inputs, config) {
            self.off_condition_ms = self.off_condition_ms.saturating_add(elapsed_ms).min(cap);
            self.on_condition_ms = 0;
            self.active_condition = Some(condition);
        } else {
            self.reset();
        }

        self.active_condition
    }

    /// Whether the accumulated timer for the opposite of `running` has
    /// matured, and whether the guard lets it through at `now_ms`.
    pub fn decide(&self, running: bool, now_ms: u64, config: &GlobalConfig) -> AssistDecision {
        let (to, elapsed_ms) = if running {
            (HvacMode::Off, self.off_condition_ms)
        } else {
            (HvacMode::Heat, self.on_condition_ms)
        };
        let Some(reason) = self.active_condition else {
            return AssistDecision::Hold;
        };
        if elapsed_ms == 0 || elapsed_ms < config.assist_timer_ms {
            return AssistDecision::Hold;
        }

        match self.guard(to, now_ms, config) {
            Ok(()) => AssistDecision::Transition { to, reason },
            Err(block) => AssistDecision::Blocked { reason, block },
        }
    }

    /// Anti-short-cycle guard shared by automatic, preset and manual changes.
    pub fn guard(&self, to: HvacMode, now_ms: u64, config: &GlobalConfig) -> Result<(), GuardBlock> {
        let Some(last) = self.last_transition_ms else {
            return Ok(());
        };
        let dwell_ms = match to {
            HvacMode::Heat => config.min_off_ms,
            HvacMode::Off => config.min_on_ms,
        };
        let since = now_ms.saturating_sub(last);
        if since >= dwell_ms {
            Ok(())
        } else {
            Err(GuardBlock {
                to,
                remaining_ms: dwell_ms - since,
            })
        }
    }

    pub fn record_transition(&mut self, now_ms: u64) {
        self.last_transition_ms = Some(now_ms);
        self.reset();
    }

    pub fn reset(&mut self) {
        self.on_condition_ms = 0;
        self.off_condition_ms = 0;
        self.active_condition = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK_MS: u64 = 60_000;

    fn inputs(room: f64, derivative: Option<f64>, eta: Option<f64>) -> ConditionInputs {
        ConditionInputs {
            room_temperature: Some(room),
            target: 21.0,
            room_derivative: derivative,
            room_eta_minutes: eta,
            water_temperature: None,
        }
    }

    fn slow_heating() -> ConditionInputs {
        inputs(19.0, Some(1.0), Some(120.0))
    }

    fn nearly_there() -> ConditionInputs {
        inputs(20.9, Some(1.0), Some(6.0))
    }

    #[test]
    fn on_conditions_are_named_in_priority_order() {
        let config = GlobalConfig::default();

        assert_eq!(
            on_condition(&slow_heating(), &config),
            Some(AssistCondition::EtaHigh)
        );

        let mut hot = inputs(20.0, Some(1.0), Some(30.0));
        hot.water_temperature = Some(42.0);
        assert_eq!(on_condition(&hot, &config), Some(AssistCondition::WaterHot));

        // A falling room far below target never reaches it on its own.
        assert_eq!(
            on_condition(&inputs(19.0, Some(-0.2), None), &config),
            Some(AssistCondition::StalledBelowTarget)
        );
    }

    #[test]
    fn eta_high_needs_a_defined_eta() {
        let config = GlobalConfig::default();
        let mut falling = inputs(19.0, Some(-0.2), None);
        falling.water_temperature = Some(45.0);

        assert_eq!(on_condition(&falling, &config), Some(AssistCondition::WaterHot));
        assert_eq!(
            on_condition(&inputs(20.8, Some(-0.2), None), &config),
            None
        );
    }

    #[test]
    fn unknown_trend_does_not_trigger() {
        let config = GlobalConfig::default();
        let unknown = inputs(19.0, None, None);

        assert_eq!(on_condition(&unknown, &config), None);
        assert_eq!(off_condition(&unknown, &config), None);
    }

    #[test]
    fn off_conditions_are_named_in_priority_order() {
        let config = GlobalConfig::default();

        assert_eq!(
            off_condition(&nearly_there(), &config),
            Some(AssistCondition::EtaLow)
        );
        assert_eq!(
            off_condition(&inputs(21.2, Some(0.5), None), &config),
            Some(AssistCondition::Overshoot)
        );
        assert_eq!(
            off_condition(&inputs(20.7, Some(0.0), None), &config),
            Some(AssistCondition::StalledAtTarget)
        );
    }

    #[test]
    fn stall_band_separates_on_from_off() {
        let config = GlobalConfig::default();
        let stalled_close = inputs(20.7, Some(0.0), None);

        assert_eq!(on_condition(&stalled_close, &config), None);
        assert_eq!(
            off_condition(&stalled_close, &config),
            Some(AssistCondition::StalledAtTarget)
        );
    }

    #[test]
    fn fires_on_exactly_at_timer_duration() {
        let config = GlobalConfig::default();
        let mut timers = AssistTimers {
            last_transition_ms: Some(0),
            ..AssistTimers::default()
        };
        let start = config.min_off_ms;

        let mut now = start;
        timers.advance(&slow_heating(), &config, 0);
        while now < start + config.assist_timer_ms {
            assert_eq!(timers.decide(false, now, &config), AssistDecision::Hold);
            now += TICK_MS;
            timers.advance(&slow_heating(), &config, TICK_MS);
        }

        assert_eq!(timers.on_condition_ms, config.assist_timer_ms);
        assert_eq!(
            timers.decide(false, now, &config),
            AssistDecision::Transition {
                to: HvacMode::Heat,
                reason: AssistCondition::EtaHigh
            }
        );
    }

    #[test]
    fn off_is_deferred_until_min_on_elapses() {
        let config = GlobalConfig::default();
        let mut timers = AssistTimers::default();
        timers.record_transition(0);

        let mut now = 0;
        let mut fired_at = None;
        while fired_at.is_none() && now <= 2_000_000 {
            let elapsed = if now == 0 { 0 } else { TICK_MS };
            timers.advance(&nearly_there(), &config, elapsed);
            match timers.decide(true, now, &config) {
                AssistDecision::Transition { to, .. } => {
                    assert_eq!(to, HvacMode::Off);
                    fired_at = Some(now);
                }
                AssistDecision::Blocked { block, .. } => {
                    assert!(now >= config.assist_timer_ms);
                    assert_eq!(block.remaining_ms, config.min_on_ms - now);
                }
                AssistDecision::Hold => assert!(now < config.assist_timer_ms),
            }
            now += TICK_MS;
        }

        assert_eq!(fired_at, Some(1_200_000));
    }

    #[test]
    fn timers_stay_mutually_exclusive_and_capped() {
        let config = GlobalConfig::default();
        let mut timers = AssistTimers::default();
        let sequence = [
            slow_heating(),
            slow_heating(),
            nearly_there(),
            inputs(20.0, None, None),
            slow_heating(),
        ];

        for step in sequence.iter().cycle().take(200) {
            timers.advance(step, &config, TICK_MS);
            assert!(timers.on_condition_ms == 0 || timers.off_condition_ms == 0);
            assert!(timers.on_condition_ms <= config.condition_timer_cap_ms());
        }

        timers.reset();
        for _ in 0..100 {
            timers.advance(&slow_heating(), &config, TICK_MS);
        }
        assert_eq!(timers.on_condition_ms, config.condition_timer_cap_ms());
    }

    #[test]
    fn neutral_readings_reset_both_timers() {
        let config = GlobalConfig::default();
        let mut timers = AssistTimers::default();
        timers.advance(&slow_heating(), &config, TICK_MS);
        assert_eq!(timers.on_condition_ms, TICK_MS);

        timers.advance(&inputs(20.0, None, None), &config, TICK_MS);
        assert_eq!(timers, AssistTimers::default());
    }

    #[test]
    fn repeated_decisions_are_stable() {
        let config = GlobalConfig::default();
        let mut timers = AssistTimers::default();
        timers.advance(&slow_heating(), &config, config.assist_timer_ms - 1);

        for _ in 0..3 {
            timers.advance(&slow_heating(), &config, 0);
            assert_eq!(timers.decide(false, 10_000_000, &config), AssistDecision::Hold);
        }
    }

    #[test]
    fn guard_block_describes_remaining_dwell() {
        let config = GlobalConfig::default();
        let timers = AssistTimers {
            last_transition_ms: Some(1_000_000),
            ..AssistTimers::default()
        };

        let block = timers
            .guard(HvacMode::Off, 1_000_000 + 780_000, &config)
            .unwrap_err();
        assert_eq!(block.describe(), "min_on 420s");
        assert!(timers.guard(HvacMode::Heat, 1_600_000, &config).is_ok());
    }
}
