//! Clock window and offset control
//!
//! While the GPU runs in a high performance tier above the transition clock,
//! the core clock is locked into a window and a per-tier offset is applied.
//! This shifts the frequency/voltage curve so the target clock is reached at a
//! lower voltage. With linear mode the window climbs towards the target clock
//! in `curve_increment` steps and the offset scales with the current clock.

use crate::device::{set_tier_offsets, ClockDomain, Device, DeviceResult};
use crate::errors::ConfigError;
use crate::guard::ActuationGuard;
use log::{debug, info, warn};
use serde::Serialize;
use std::ops::RangeInclusive;
use std::time::{Duration, Instant};

/// Readings within this many MHz of a boundary count as reaching it
pub const CLOCK_TOLERANCE: u32 = 4;

/// Clock step used when the supported clock table gives no usable step
pub const FALLBACK_STEP_MHZ: u32 = 15;

/// Clock settings resolved from the configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClockSettings {
    pub core_offset: i32,
    pub memory_offset: i32,
    pub target_clock: u32,
    pub transition_clock: u32,
    pub linear: bool,
    /// Window step in MHz, 0 for twice the clock step
    pub curve_increment: u32,
    /// Clock step in MHz, 0 to infer it from the device
    pub clock_step: u32,
    /// Tiers that count as "under load" and receive offsets
    pub tiers: RangeInclusive<u32>,
}

/// Average spacing of the first three entries of a descending clock table
pub fn infer_step_mhz(clocks: &[u32]) -> Option<u32> {
    let head = &clocks[..clocks.len().min(3)];
    if head.len() < 2 {
        return None;
    }

    let total: i64 = head
        .windows(2)
        .map(|pair| i64::from(pair[0]) - i64::from(pair[1]))
        .sum();
    let average = (total as f64 / (head.len() - 1) as f64).round();

    if average > 0.0 {
        Some(average as u32)
    } else {
        None
    }
}

/// Clock step from the device table, falling back to [`FALLBACK_STEP_MHZ`]
pub fn clock_step_from_table(clocks: &[u32]) -> u32 {
    match infer_step_mhz(clocks) {
        Some(step) => {
            debug!("Clock step is {} MHz", step);
            step
        }
        None => {
            warn!(
                "Unable to determine clock step MHz, using fallback value of {}",
                FALLBACK_STEP_MHZ
            );
            FALLBACK_STEP_MHZ
        }
    }
}

/// Round a positive value up to the next multiple of `step`
pub fn round_up_to_multiple(value: i64, step: u32) -> i64 {
    let step = i64::from(step);
    if value == 0 || step == 0 || value % step == 0 {
        return value;
    }
    (value.div_euclid(step) + 1) * step
}

/// Scale `max_offset` by where `clock` sits between `min_val` and `max_val`.
///
/// Returns 0 at or below `min_val` and exactly `max_offset` at or above
/// `max_val`. In between the result is a multiple of `step_mhz`, rounded up
/// but never above `max_offset`.
pub fn interpolate_offset(
    clock: u32,
    max_offset: i32,
    min_val: u32,
    max_val: u32,
    step_mhz: u32,
) -> i32 {
    if clock <= min_val {
        return 0;
    }
    if clock >= max_val {
        return max_offset;
    }

    let scale = f64::from(clock - min_val) / f64::from(max_val - min_val);
    let scaled = (scale * f64::from(max_offset)) as i64;
    round_up_to_multiple(scaled, step_mhz).clamp(0, i64::from(max_offset.max(0))) as i32
}

/// Locked clock window plus the offset that goes with it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClockWindow {
    pub min_clock: u32,
    pub max_clock: u32,
    pub transition_clock: u32,
    pub target_clock: u32,
    pub offset: i32,
    pub curve_increment: u32,
    pub step_mhz: u32,
}

impl ClockWindow {
    /// Resolve clock step and curve increment against the device clock table.
    pub fn configure(settings: &ClockSettings, supported: &[u32]) -> Result<Self, ConfigError> {
        let step_mhz = if settings.clock_step > 0 {
            debug!("Using user defined clock step of {} MHz", settings.clock_step);
            settings.clock_step
        } else {
            clock_step_from_table(supported)
        };

        let curve_increment = if settings.curve_increment == 0 {
            step_mhz.saturating_mul(2)
        } else {
            settings.curve_increment
        };

        if curve_increment % step_mhz != 0 {
            warn!(
                "Curve increment should be divisible by clock step ({})",
                step_mhz
            );
        }

        let min_increment = step_mhz.saturating_mul(2);
        if curve_increment < min_increment {
            return Err(ConfigError::CurveIncrementTooSmall(min_increment));
        }

        Ok(Self {
            min_clock: settings.transition_clock,
            max_clock: settings.target_clock,
            transition_clock: settings.transition_clock,
            target_clock: settings.target_clock,
            offset: settings.core_offset,
            curve_increment,
            step_mhz,
        })
    }

    pub fn bounds(&self) -> (u32, u32) {
        (self.min_clock, self.max_clock)
    }

    /// Restart the window at the bottom of the range
    fn reset(&mut self) {
        self.min_clock = self.transition_clock;
        self.max_clock = self.transition_clock.saturating_add(self.curve_increment);
    }

    fn raise(&mut self) -> bool {
        if self.max_clock.saturating_add(self.curve_increment) > self.target_clock {
            return false;
        }
        self.min_clock += self.curve_increment;
        self.max_clock += self.curve_increment;
        true
    }

    fn lower(&mut self) -> bool {
        if self.min_clock < self.transition_clock.saturating_add(self.curve_increment) {
            return false;
        }
        self.min_clock -= self.curve_increment;
        self.max_clock -= self.curve_increment;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UndervoltState {
    Disabled,
    Active,
}

/// What the controller wants applied after a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockAction {
    /// Disabled -> Active: lock the window, apply core and memory offsets
    Enable,
    /// Window or offset moved while Active
    Update,
    /// Zero the offsets and cap clocks at the transition clock
    Disable,
}

/// Per-channel cache of the last values written to the device
#[derive(Debug, Clone, Default)]
pub struct LastApplied {
    pub window: ActuationGuard<(u32, u32)>,
    pub core_offset: ActuationGuard<i32>,
    pub memory_offset: ActuationGuard<i32>,
}

/// Two-state clock window controller
pub struct ClockWindowController {
    window: ClockWindow,
    max_offset: i32,
    memory_offset: i32,
    tiers: RangeInclusive<u32>,
    linear: bool,
    interval: Duration,
    dry_run: bool,
    state: UndervoltState,
    last_change: Instant,
    last_clock: Option<u32>,
    pending_update: bool,
    applied: LastApplied,
}

impl ClockWindowController {
    pub fn new(
        settings: &ClockSettings,
        window: ClockWindow,
        interval: Duration,
        dry_run: bool,
        now: Instant,
    ) -> Self {
        Self {
            window,
            max_offset: settings.core_offset,
            memory_offset: settings.memory_offset,
            tiers: settings.tiers.clone(),
            linear: settings.linear,
            interval,
            dry_run,
            state: UndervoltState::Disabled,
            last_change: now,
            last_clock: None,
            // Cap clocks at the transition clock on the first tick
            pending_update: true,
            applied: LastApplied::default(),
        }
    }

    pub fn state(&self) -> UndervoltState {
        self.state
    }

    pub fn window(&self) -> &ClockWindow {
        &self.window
    }

    pub fn applied(&self) -> &LastApplied {
        &self.applied
    }

    /// Advance the state machine by one tick.
    ///
    /// `tier` and `clock` are the current performance state and core clock.
    /// Returns the action to apply, if any.
    pub fn step(&mut self, tier: u32, clock: u32, now: Instant) -> Option<ClockAction> {
        let elapsed = now.saturating_duration_since(self.last_change);
        let was_active = self.state == UndervoltState::Active;
        let mut active = was_active;
        let transition = self.window.transition_clock;

        if self.tiers.contains(&tier) {
            if !was_active && clock + CLOCK_TOLERANCE >= transition && elapsed > self.interval {
                active = true;
                if self.linear {
                    self.window.reset();
                }
            } else if was_active
                && clock <= transition + CLOCK_TOLERANCE
                && elapsed > self.interval * 2
            {
                active = false;
            }

            if self.linear {
                if active {
                    let moved = if clock + CLOCK_TOLERANCE >= self.window.max_clock
                        && elapsed > self.interval
                    {
                        self.window.raise()
                    } else if clock <= self.window.min_clock + CLOCK_TOLERANCE
                        && elapsed > self.interval * 2
                    {
                        self.window.lower()
                    } else {
                        false
                    };

                    if moved && active == was_active {
                        self.pending_update = true;
                    }
                }

                if self.last_clock != Some(clock) {
                    self.window.offset = interpolate_offset(
                        clock,
                        self.max_offset,
                        transition,
                        self.window.target_clock,
                        self.window.step_mhz,
                    );
                    if active {
                        self.pending_update = true;
                    }
                }
            }
        } else {
            active = false;
        }

        self.last_clock = Some(clock);

        let action = match (was_active, active) {
            (false, true) => Some(ClockAction::Enable),
            (true, false) => Some(ClockAction::Disable),
            (true, true) if self.pending_update => Some(ClockAction::Update),
            (false, false) if self.pending_update => Some(ClockAction::Disable),
            _ => None,
        };

        if action.is_some() {
            self.pending_update = false;
            self.last_change = now;
            self.state = if active {
                UndervoltState::Active
            } else {
                UndervoltState::Disabled
            };
        }

        action
    }

    /// Read the tier and clock, step the state machine and apply the result
    pub fn update<D: Device + ?Sized>(
        &mut self,
        device: &mut D,
        now: Instant,
    ) -> DeviceResult<Option<ClockAction>> {
        let tier = device.performance_state()?;
        let clock = device.clock(ClockDomain::Graphics)?;

        let action = self.step(tier, clock, now);
        if let Some(action) = action {
            self.apply(device, action, tier, clock)?;
        }
        Ok(action)
    }

    /// Write the device state for `action`
    pub fn apply<D: Device + ?Sized>(
        &mut self,
        device: &mut D,
        action: ClockAction,
        tier: u32,
        clock: u32,
    ) -> DeviceResult<()> {
        let force = action != ClockAction::Update;
        let dry_run = self.dry_run;
        let tiers = self.tiers.clone();

        match action {
            ClockAction::Enable | ClockAction::Update => {
                if action == ClockAction::Enable {
                    info!("Enabling undervolt settings at P{} {}", tier, clock);
                } else {
                    info!("Updating clock lock and offset at P{} {}", tier, clock);
                }

                if self.window.max_clock > self.window.target_clock {
                    warn!(
                        "Attempted to set max clock to {} while user defined target clock is {}",
                        self.window.max_clock, self.window.target_clock
                    );
                    self.window.max_clock = self.window.target_clock;
                }

                self.applied
                    .window
                    .apply(self.window.bounds(), force, |(min, max)| {
                        lock_clocks(device, min, max, dry_run)
                    })?;

                if self.window.offset > self.max_offset {
                    warn!(
                        "Attempted to set offset to {} while user defined offset is {}",
                        self.window.offset, self.max_offset
                    );
                    self.window.offset = self.max_offset;
                }

                self.applied
                    .core_offset
                    .apply(self.window.offset, force, |offset| {
                        write_offsets(device, ClockDomain::Graphics, tiers.clone(), offset, dry_run)
                    })?;

                if action == ClockAction::Enable && self.memory_offset > 0 {
                    self.applied
                        .memory_offset
                        .apply(self.memory_offset, force, |offset| {
                            write_offsets(
                                device,
                                ClockDomain::Memory,
                                tiers.clone(),
                                offset,
                                dry_run,
                            )
                        })?;
                }
            }
            ClockAction::Disable => {
                info!("Disabling undervolt settings at P{} {}", tier, clock);

                self.applied.core_offset.apply(0, force, |offset| {
                    write_offsets(device, ClockDomain::Graphics, tiers.clone(), offset, dry_run)
                })?;

                if self.memory_offset > 0 {
                    self.applied.memory_offset.apply(0, force, |offset| {
                        write_offsets(device, ClockDomain::Memory, tiers.clone(), offset, dry_run)
                    })?;
                }

                let cap = (0, self.window.transition_clock);
                self.applied
                    .window
                    .apply(cap, force, |(min, max)| lock_clocks(device, min, max, dry_run))?;
            }
        }

        Ok(())
    }

    /// Zero all offsets and release the clock lock entirely
    pub fn restore<D: Device + ?Sized>(&mut self, device: &mut D) -> DeviceResult<()> {
        self.applied = LastApplied::default();
        if self.dry_run {
            return Ok(());
        }

        set_tier_offsets(device, ClockDomain::Graphics, self.tiers.clone(), 0)?;
        if self.memory_offset > 0 {
            set_tier_offsets(device, ClockDomain::Memory, self.tiers.clone(), 0)?;
        }
        device.reset_locked_clocks()?;
        debug!("Clock offsets zeroed and clock lock released");
        Ok(())
    }
}

fn lock_clocks<D: Device + ?Sized>(
    device: &mut D,
    min: u32,
    max: u32,
    dry_run: bool,
) -> DeviceResult<()> {
    if dry_run {
        info!("Would lock core clocks at {} - {}", min, max);
        return Ok(());
    }
    device.set_locked_clocks(min, max)?;
    debug!("Locking core clocks at {} - {}", min, max);
    Ok(())
}

fn write_offsets<D: Device + ?Sized>(
    device: &mut D,
    domain: ClockDomain,
    tiers: RangeInclusive<u32>,
    offset: i32,
    dry_run: bool,
) -> DeviceResult<()> {
    if dry_run {
        info!("Would set {:?} offset to {}", domain, offset);
        return Ok(());
    }
    set_tier_offsets(device, domain, tiers, offset)?;
    debug!("Setting {:?} offset to {}", domain, offset);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::{Command, SimulatedDevice};
    use test_case::test_case;

    const INTERVAL: Duration = Duration::from_secs(1);

    fn settings(linear: bool) -> ClockSettings {
        ClockSettings {
            core_offset: 150,
            memory_offset: 0,
            target_clock: 1800,
            transition_clock: 1500,
            linear,
            curve_increment: 30,
            clock_step: 15,
            tiers: 0..=0,
        }
    }

    fn controller(settings: &ClockSettings, start: Instant) -> ClockWindowController {
        let window = ClockWindow::configure(settings, &[]).unwrap();
        ClockWindowController::new(settings, window, INTERVAL, false, start)
    }

    fn at(start: Instant, secs: f64) -> Instant {
        start + Duration::from_secs_f64(secs)
    }

    #[test_case(1500 => 0 ; "at min")]
    #[test_case(1400 => 0 ; "below min")]
    #[test_case(1800 => 150 ; "at max")]
    #[test_case(1950 => 150 ; "above max")]
    #[test_case(1650 => 75 ; "halfway")]
    #[test_case(1501 => 0 ; "scaled below one stays zero")]
    #[test_case(1503 => 15 ; "just above min rounds up")]
    #[test_case(1799 => 150 ; "just below max capped")]
    fn test_interpolate_offset(clock: u32) -> i32 {
        interpolate_offset(clock, 150, 1500, 1800, 15)
    }

    #[test]
    fn test_interpolate_offset_never_exceeds_max() {
        for clock in 1500..=1800 {
            let offset = interpolate_offset(clock, 100, 1500, 1800, 15);
            assert!(offset <= 100, "offset {} at {}", offset, clock);
            if offset != 100 {
                assert_eq!(offset % 15, 0, "offset {} at {}", offset, clock);
            }
        }
    }

    #[test]
    fn test_step_inference() {
        assert_eq!(infer_step_mhz(&[1500, 1485, 1470, 1200, 1000]), Some(15));
        assert_eq!(infer_step_mhz(&[2100, 2085, 2055]), Some(23));
        assert_eq!(infer_step_mhz(&[1500]), None);
        assert_eq!(infer_step_mhz(&[1500, 1500, 1500]), None);
        assert_eq!(clock_step_from_table(&[]), FALLBACK_STEP_MHZ);
    }

    #[test]
    fn test_configure_defaults_and_rejects_small_increment() {
        let mut s = settings(true);
        s.curve_increment = 0;
        s.clock_step = 0;
        let window = ClockWindow::configure(&s, &[1500, 1485, 1470]).unwrap();
        assert_eq!(window.step_mhz, 15);
        assert_eq!(window.curve_increment, 30);

        s.curve_increment = 20;
        assert_eq!(
            ClockWindow::configure(&s, &[1500, 1485, 1470]),
            Err(ConfigError::CurveIncrementTooSmall(30))
        );
    }

    #[test]
    fn test_huge_clock_step_does_not_overflow() {
        let mut s = settings(true);
        s.clock_step = 3_000_000_000;
        s.curve_increment = 100;
        assert_eq!(
            ClockWindow::configure(&s, &[]),
            Err(ConfigError::CurveIncrementTooSmall(u32::MAX))
        );

        s.curve_increment = 0;
        let window = ClockWindow::configure(&s, &[]).unwrap();
        assert_eq!(window.curve_increment, u32::MAX);
    }

    #[test]
    fn test_oversized_increment_is_clamped_to_target() {
        let start = Instant::now();
        let mut s = settings(true);
        s.curve_increment = 400;
        let mut c = controller(&s, start);

        let mut device = SimulatedDevice::new();
        device.set_performance_state(0);
        device.set_clock(1700);

        assert_eq!(
            c.update(&mut device, at(start, 0.1)).unwrap(),
            Some(ClockAction::Disable)
        );
        device.take_commands();

        assert_eq!(
            c.update(&mut device, at(start, 1.2)).unwrap(),
            Some(ClockAction::Enable)
        );
        assert_eq!(c.window().bounds(), (1500, 1800));

        let locks: Vec<_> = device
            .take_commands()
            .into_iter()
            .filter(|cmd| matches!(cmd, Command::LockedClocks { .. }))
            .collect();
        assert_eq!(locks, vec![Command::LockedClocks { min: 1500, max: 1800 }]);
    }

    #[test]
    fn test_first_tick_caps_clocks() {
        let start = Instant::now();
        let mut c = controller(&settings(false), start);
        assert_eq!(c.step(8, 300, at(start, 0.5)), Some(ClockAction::Disable));
        assert_eq!(c.step(8, 300, at(start, 1.5)), None);
    }

    #[test]
    fn test_enable_is_debounced_and_fires_once() {
        let start = Instant::now();
        let mut c = controller(&settings(false), start);
        c.step(0, 1700, at(start, 0.1));

        let actions: Vec<_> = (1..20)
            .filter_map(|i| c.step(0, 1700, at(start, 0.1 + f64::from(i) * 0.6)))
            .collect();

        assert_eq!(actions, vec![ClockAction::Enable]);
        assert_eq!(c.state(), UndervoltState::Active);
        assert_eq!(c.window().bounds(), (1500, 1800));
        assert_eq!(c.window().offset, 150);
    }

    #[test]
    fn test_leaving_tier_range_disables_immediately() {
        let start = Instant::now();
        let mut c = controller(&settings(false), start);
        c.step(0, 1700, at(start, 0.1));
        assert_eq!(c.step(0, 1700, at(start, 1.2)), Some(ClockAction::Enable));
        assert_eq!(c.step(2, 1700, at(start, 1.3)), Some(ClockAction::Disable));
        assert_eq!(c.state(), UndervoltState::Disabled);
    }

    #[test]
    fn test_falling_to_transition_disables_after_double_interval() {
        let start = Instant::now();
        let mut c = controller(&settings(false), start);
        c.step(0, 1700, at(start, 0.1));
        c.step(0, 1700, at(start, 1.2));

        assert_eq!(c.step(0, 1502, at(start, 2.2)), None);
        assert_eq!(c.step(0, 1502, at(start, 3.1)), None);
        assert_eq!(c.step(0, 1502, at(start, 3.3)), Some(ClockAction::Disable));
    }

    #[test]
    fn test_linear_window_climbs_and_never_exceeds_target() {
        let start = Instant::now();
        let mut c = controller(&settings(true), start);
        c.step(0, 1790, at(start, 0.1));

        let mut enables = 0;
        for i in 1..100 {
            let now = at(start, 0.1 + f64::from(i) * 1.1);
            if c.step(0, 1790, now) == Some(ClockAction::Enable) {
                enables += 1;
            }
            let (min, max) = c.window().bounds();
            assert!(min >= 1500 && max <= 1800, "window {}-{}", min, max);
            assert_eq!(max - min, 30);
        }

        assert_eq!(enables, 1);
        assert_eq!(c.window().bounds(), (1770, 1800));
    }

    #[test]
    fn test_linear_window_lowers_when_clock_sits_at_bottom() {
        let start = Instant::now();
        let mut c = controller(&settings(true), start);
        c.step(0, 1600, at(start, 0.1));
        // Enable resets to 1500-1530, then the same tick raises to 1530-1560
        assert_eq!(c.step(0, 1600, at(start, 1.2)), Some(ClockAction::Enable));
        assert_eq!(c.window().bounds(), (1530, 1560));

        assert_eq!(c.step(0, 1600, at(start, 2.3)), Some(ClockAction::Update));
        assert_eq!(c.window().bounds(), (1560, 1590));

        // Near the bottom of the window after two intervals: step down
        assert_eq!(c.step(0, 1562, at(start, 4.4)), Some(ClockAction::Update));
        assert_eq!(c.window().bounds(), (1530, 1560));
    }

    #[test]
    fn test_offset_follows_clock_in_linear_mode() {
        let start = Instant::now();
        let mut c = controller(&settings(true), start);
        c.step(0, 1650, at(start, 0.1));
        c.step(0, 1650, at(start, 1.2));
        assert_eq!(c.window().offset, 75);

        c.step(0, 1800, at(start, 1.4));
        assert_eq!(c.window().offset, 150);
    }

    #[test]
    fn test_apply_skips_unchanged_writes_and_sets_memory_on_entry_only() {
        let start = Instant::now();
        let mut s = settings(false);
        s.memory_offset = 500;
        s.tiers = 0..=1;
        let mut c = controller(&s, start);
        let mut device = SimulatedDevice::new();

        c.apply(&mut device, ClockAction::Enable, 0, 1700).unwrap();
        assert_eq!(device.locked_clocks(), Some((1500, 1800)));
        assert_eq!(device.offset(ClockDomain::Graphics, 1), 150);
        assert_eq!(device.offset(ClockDomain::Memory, 0), 500);
        device.take_commands();

        c.apply(&mut device, ClockAction::Update, 0, 1700).unwrap();
        assert!(device.commands().is_empty());

        c.apply(&mut device, ClockAction::Disable, 1, 1500).unwrap();
        assert_eq!(device.locked_clocks(), Some((0, 1500)));
        assert_eq!(device.offset(ClockDomain::Graphics, 0), 0);
        assert_eq!(device.offset(ClockDomain::Memory, 1), 0);
        assert!(device.commands().contains(&Command::LockedClocks { min: 0, max: 1500 }));
    }

    #[test]
    fn test_restore_releases_lock() {
        let start = Instant::now();
        let mut c = controller(&settings(false), start);
        let mut device = SimulatedDevice::new();
        c.apply(&mut device, ClockAction::Enable, 0, 1700).unwrap();
        c.restore(&mut device).unwrap();
        assert_eq!(device.locked_clocks(), None);
        assert_eq!(device.offset(ClockDomain::Graphics, 0), 0);
    }
}
