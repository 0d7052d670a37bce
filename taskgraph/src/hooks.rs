// src/hooks.rs
//
// Render-hook protocol.
//
// Each graph state carries an ordered list of hooks that own its time course.
// The engine invokes them and reads back at most one action; it never looks
// inside. Every hook has two faces:
// - display:  real time against a `Window`, for a human participant;
// - simulate: virtual time, with a pre-decided response from an agent.
//
// Variants:
// - PassiveHook:   fixed-duration stimulus.
// - FeedbackHook:  passive stimulus showing the last reward and the total.
// - ActionHook:    response window over a key set, with an optional
//                  too-early phase and a configurable timeout action.
// - CompositeHook: preparation stimulus, response window, then feedback
//                  that depends on the choice; optional random left/right flip.
//
// `HookSpec` is the declarative (serde) form used by task manifests.

use std::fmt;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::condition::{ActionRemap, ConditionTag};
use crate::error::TaskResult;
use crate::event_log::{EventFields, EventLogger, RlLabel};
use crate::graph::StateId;
use crate::window::{Side, Stimulus, Window};

/// What the engine knows when it plays a state's hooks.
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    pub state: StateId,
    pub condition: &'a ConditionTag,
    /// Reward of the transition that led here.
    pub reward: f64,
    pub total_reward: f64,
    pub last_action: Option<usize>,
    /// Physical actions accepted in this state.
    pub avail_actions: &'a [usize],
    pub remap: Option<&'a ActionRemap>,
}

impl HookContext<'_> {
    /// Action index as it should appear in the log's `action` column.
    pub fn behavioral(&self, action: usize) -> usize {
        self.remap
            .and_then(|m| m.get(&action).copied())
            .unwrap_or(action)
    }

    pub fn is_legal(&self, action: usize) -> bool {
        self.avail_actions.contains(&action)
    }
}

/// Pre-decided response handed to `simulate`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimResponse {
    pub action: usize,
    /// Reaction time (s) from response-window onset.
    pub rt: f64,
}

/// Action produced by an interactive hook.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HookOutcome {
    pub action: usize,
    /// Unused tail of the response window (s).
    pub remainder: f64,
    pub timed_out: bool,
}

pub trait RenderHook: fmt::Debug + Send {
    fn name(&self) -> &str;

    /// Nominal duration (s); for interactive hooks, the response window.
    fn duration(&self) -> f64;

    fn set_duration(&mut self, seconds: f64);

    /// Whether this hook consumes a response.
    fn is_interactive(&self) -> bool {
        false
    }

    /// One-time initialisation before the first trial. `keys[i]` is the
    /// physical key for action `i`.
    fn setup(&mut self, _window: Option<&mut dyn Window>, _keys: &[String]) {}

    fn display(
        &mut self,
        window: &mut dyn Window,
        logger: &mut EventLogger,
        ctx: &HookContext<'_>,
    ) -> TaskResult<Option<HookOutcome>>;

    fn simulate(
        &mut self,
        logger: &mut EventLogger,
        response: Option<SimResponse>,
        ctx: &HookContext<'_>,
    ) -> TaskResult<Option<HookOutcome>>;
}

// ---------------------------------------------------------------------------
// Passive
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PassiveHook {
    name: String,
    text: String,
    duration: f64,
    label: Option<RlLabel>,
}

impl PassiveHook {
    pub fn new(name: impl Into<String>, text: impl Into<String>, duration: f64) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
            duration,
            label: None,
        }
    }

    pub fn with_label(mut self, label: RlLabel) -> Self {
        self.label = Some(label);
        self
    }

    fn entry(&self) -> EventFields {
        EventFields::new(&self.name)
            .expected(self.duration)
            .label_opt(self.label)
    }
}

impl RenderHook for PassiveHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn duration(&self) -> f64 {
        self.duration
    }

    fn set_duration(&mut self, seconds: f64) {
        self.duration = seconds.max(0.0);
    }

    fn display(
        &mut self,
        window: &mut dyn Window,
        logger: &mut EventLogger,
        _ctx: &HookContext<'_>,
    ) -> TaskResult<Option<HookOutcome>> {
        window.present(&Stimulus::new(&self.name, &self.text));
        window.flip();
        let start = logger.now();
        logger.log_event(self.entry(), None, None)?;
        logger.wait(window, self.duration, start)?;
        Ok(None)
    }

    fn simulate(
        &mut self,
        logger: &mut EventLogger,
        _response: Option<SimResponse>,
        _ctx: &HookContext<'_>,
    ) -> TaskResult<Option<HookOutcome>> {
        logger.log_event(self.entry(), None, None)?;
        logger.advance(self.duration);
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Feedback
// ---------------------------------------------------------------------------

/// Passive stimulus whose text may reference `{reward}` and `{total}`.
#[derive(Debug, Clone)]
pub struct FeedbackHook {
    name: String,
    template: String,
    duration: f64,
}

impl FeedbackHook {
    pub fn new(name: impl Into<String>, template: impl Into<String>, duration: f64) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
            duration,
        }
    }

    pub fn render_text(&self, ctx: &HookContext<'_>) -> String {
        self.template
            .replace("{reward}", &ctx.reward.to_string())
            .replace("{total}", &ctx.total_reward.to_string())
            .replace("{condition}", ctx.condition.as_str())
    }

    fn entry(&self, ctx: &HookContext<'_>) -> EventFields {
        EventFields::new(&self.name)
            .expected(self.duration)
            .reward(ctx.reward)
    }
}

impl RenderHook for FeedbackHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn duration(&self) -> f64 {
        self.duration
    }

    fn set_duration(&mut self, seconds: f64) {
        self.duration = seconds.max(0.0);
    }

    fn display(
        &mut self,
        window: &mut dyn Window,
        logger: &mut EventLogger,
        ctx: &HookContext<'_>,
    ) -> TaskResult<Option<HookOutcome>> {
        window.present(&Stimulus::new(&self.name, self.render_text(ctx)));
        window.flip();
        let start = logger.now();
        logger.log_event(self.entry(ctx), None, None)?;
        logger.wait(window, self.duration, start)?;
        Ok(None)
    }

    fn simulate(
        &mut self,
        logger: &mut EventLogger,
        _response: Option<SimResponse>,
        ctx: &HookContext<'_>,
    ) -> TaskResult<Option<HookOutcome>> {
        logger.log_event(self.entry(ctx), None, None)?;
        logger.advance(self.duration);
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ActionHook {
    name: String,
    text: String,
    duration: f64,
    /// `keys[i]` selects physical action `i`. Empty means "take the task's keys at setup".
    keys: Vec<String>,
    /// Action delivered when the window closes without a valid press.
    timeout_action: Option<usize>,
    /// Length of a pre-window phase in which presses count as too early.
    too_early: Option<f64>,
}

impl ActionHook {
    pub fn new(name: impl Into<String>, duration: f64) -> Self {
        Self {
            name: name.into(),
            text: String::new(),
            duration,
            keys: Vec::new(),
            timeout_action: None,
            too_early: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_keys<S: Into<String>>(mut self, keys: impl IntoIterator<Item = S>) -> Self {
        self.keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout_action(mut self, action: usize) -> Self {
        self.timeout_action = Some(action);
        self
    }

    pub fn with_too_early(mut self, seconds: f64) -> Self {
        self.too_early = Some(seconds);
        self
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    fn key_for(&self, action: usize) -> String {
        self.keys
            .get(action)
            .cloned()
            .unwrap_or_else(|| action.to_string())
    }

    /// Keys admitted in this state.
    fn admitted_keys(&self, ctx: &HookContext<'_>) -> Vec<String> {
        self.keys
            .iter()
            .enumerate()
            .filter(|(i, _)| ctx.is_legal(*i))
            .map(|(_, k)| k.clone())
            .collect()
    }

    fn action_for_key(&self, key: &str) -> Option<usize> {
        self.keys.iter().position(|k| k == key)
    }

    fn timeout(
        &self,
        logger: &mut EventLogger,
        ctx: &HookContext<'_>,
        window_start: f64,
        late_key: Option<(String, f64)>,
    ) -> TaskResult<Option<HookOutcome>> {
        let mut fields = EventFields::new("response-time-out").expected(self.duration);
        match late_key {
            Some((key, rt)) => fields = fields.response(rt, key, true),
            None => fields.response_late = Some(false),
        }
        if let Some(a) = self.timeout_action {
            fields = fields.label(RlLabel::Action).action(ctx.behavioral(a));
        }
        logger.log_event(fields, None, Some(window_start))?;
        Ok(self.timeout_action.map(|action| HookOutcome {
            action,
            remainder: 0.0,
            timed_out: true,
        }))
    }
}

impl RenderHook for ActionHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn duration(&self) -> f64 {
        self.duration
    }

    fn set_duration(&mut self, seconds: f64) {
        self.duration = seconds.max(0.0);
    }

    fn is_interactive(&self) -> bool {
        true
    }

    fn setup(&mut self, _window: Option<&mut dyn Window>, keys: &[String]) {
        if self.keys.is_empty() {
            self.keys = keys.to_vec();
        }
    }

    fn display(
        &mut self,
        window: &mut dyn Window,
        logger: &mut EventLogger,
        ctx: &HookContext<'_>,
    ) -> TaskResult<Option<HookOutcome>> {
        let admitted = self.admitted_keys(ctx);
        window.present(&Stimulus::new(&self.name, &self.text));
        window.flip();

        if let Some(pre) = self.too_early {
            let pre_start = logger.now();
            logger.log_event(
                EventFields::new(format!("{}-wait", self.name)).expected(pre),
                None,
                None,
            )?;
            if let Some(press) = logger.wait_for_key(window, &admitted, pre, pre_start)? {
                logger.log_event(
                    EventFields::new("response-too-early").response(
                        press.time - pre_start,
                        press.key,
                        false,
                    ),
                    None,
                    Some(press.time),
                )?;
                // The trial keeps its nominal length.
                logger.wait(window, pre + self.duration, pre_start)?;
                return self.timeout(logger, ctx, pre_start + pre, None);
            }
        }

        let start = logger.now();
        logger.log_event(
            EventFields::new(&self.name).expected(self.duration),
            None,
            None,
        )?;
        let Some(press) = logger.wait_for_key(window, &admitted, self.duration, start)? else {
            let late = logger
                .late_key(window, &admitted)?
                .map(|p| (p.key, p.time - start));
            return self.timeout(logger, ctx, start, late);
        };
        let Some(action) = self.action_for_key(&press.key) else {
            return self.timeout(logger, ctx, start, None);
        };
        let rt = (press.time - start).max(0.0);
        logger.log_event(
            EventFields::new("response")
                .response(rt, press.key, false)
                .label(RlLabel::Action)
                .action(ctx.behavioral(action)),
            None,
            Some(press.time),
        )?;
        Ok(Some(HookOutcome {
            action,
            remainder: (self.duration - rt).max(0.0),
            timed_out: false,
        }))
    }

    fn simulate(
        &mut self,
        logger: &mut EventLogger,
        response: Option<SimResponse>,
        ctx: &HookContext<'_>,
    ) -> TaskResult<Option<HookOutcome>> {
        if let Some(pre) = self.too_early {
            logger.log_event(
                EventFields::new(format!("{}-wait", self.name)).expected(pre),
                None,
                None,
            )?;
            logger.advance(pre);
        }

        let start = logger.now();
        logger.log_event(
            EventFields::new(&self.name).expected(self.duration),
            None,
            None,
        )?;
        // Choosing a keyless timeout action means withholding the press.
        let response = response.filter(|r| {
            ctx.is_legal(r.action)
                && !(self.timeout_action == Some(r.action) && self.keys.get(r.action).is_none())
        });
        let Some(r) = response else {
            logger.simulated_key_strokes(f64::INFINITY, self.duration);
            return self.timeout(logger, ctx, start, None);
        };
        match logger.simulated_key_strokes(r.rt, self.duration) {
            Some(_) => {
                logger.log_event(
                    EventFields::new("response")
                        .response(r.rt, self.key_for(r.action), false)
                        .label(RlLabel::Action)
                        .action(ctx.behavioral(r.action)),
                    None,
                    None,
                )?;
                Ok(Some(HookOutcome {
                    action: r.action,
                    remainder: (self.duration - r.rt).max(0.0),
                    timed_out: false,
                }))
            }
            None => self.timeout(logger, ctx, start, Some((self.key_for(r.action), r.rt))),
        }
    }
}

// ---------------------------------------------------------------------------
// Composite
// ---------------------------------------------------------------------------

/// `phase1 -> response window -> phase2`.
///
/// With `flip` enabled the two options swap sides on a fair coin, and the
/// key-to-action mapping swaps with them.
#[derive(Debug, Clone)]
pub struct CompositeHook {
    name: String,
    prepare_text: String,
    prepare_duration: f64,
    options: Vec<String>,
    duration: f64,
    feedback: Vec<String>,
    feedback_duration: f64,
    keys: Vec<String>,
    timeout_action: Option<usize>,
    flip: bool,
    rng: ChaCha8Rng,
}

impl CompositeHook {
    pub fn new(name: impl Into<String>, options: Vec<String>, duration: f64, seed: u64) -> Self {
        Self {
            name: name.into(),
            prepare_text: "+".to_string(),
            prepare_duration: 0.0,
            options,
            duration,
            feedback: Vec::new(),
            feedback_duration: 0.0,
            keys: Vec::new(),
            timeout_action: None,
            flip: false,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn with_prepare(mut self, text: impl Into<String>, duration: f64) -> Self {
        self.prepare_text = text.into();
        self.prepare_duration = duration;
        self
    }

    /// `texts[a]` is shown after choosing action `a`.
    pub fn with_feedback(mut self, texts: Vec<String>, duration: f64) -> Self {
        self.feedback = texts;
        self.feedback_duration = duration;
        self
    }

    pub fn with_keys<S: Into<String>>(mut self, keys: impl IntoIterator<Item = S>) -> Self {
        self.keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout_action(mut self, action: usize) -> Self {
        self.timeout_action = Some(action);
        self
    }

    pub fn with_flip(mut self, flip: bool) -> Self {
        self.flip = flip;
        self
    }

    /// Key slot <-> action; an involution, so it maps both ways.
    fn swap(flipped: bool, index: usize) -> usize {
        match (flipped, index) {
            (true, 0) => 1,
            (true, 1) => 0,
            (_, i) => i,
        }
    }

    fn draw_flip(&mut self) -> bool {
        self.flip && self.rng.gen_bool(0.5)
    }

    fn prepare_fields(&self) -> EventFields {
        EventFields::new(format!("{}-phase1", self.name)).expected(self.prepare_duration)
    }

    fn window_fields(&self, flipped: bool) -> EventFields {
        EventFields::new(&self.name)
            .expected(self.duration)
            .misc(format!("flipped={flipped}"))
    }

    fn feedback_fields(&self, action: usize) -> EventFields {
        EventFields::new(format!("{}-phase2", self.name))
            .expected(self.feedback_duration)
            .misc(format!("choice={action}"))
    }

    fn feedback_text(&self, action: usize) -> String {
        self.feedback
            .get(action)
            .or_else(|| self.options.get(action))
            .cloned()
            .unwrap_or_default()
    }

    fn timeout(
        &self,
        logger: &mut EventLogger,
        ctx: &HookContext<'_>,
        start: f64,
        late: Option<(String, f64)>,
    ) -> TaskResult<Option<HookOutcome>> {
        let mut fields = EventFields::new("response-time-out").expected(self.duration);
        match late {
            Some((key, rt)) => fields = fields.response(rt, key, true),
            None => fields.response_late = Some(false),
        }
        if let Some(a) = self.timeout_action {
            fields = fields.label(RlLabel::Action).action(ctx.behavioral(a));
        }
        logger.log_event(fields, None, Some(start))?;
        Ok(self.timeout_action.map(|action| HookOutcome {
            action,
            remainder: 0.0,
            timed_out: true,
        }))
    }
}

impl RenderHook for CompositeHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn duration(&self) -> f64 {
        self.duration
    }

    fn set_duration(&mut self, seconds: f64) {
        self.duration = seconds.max(0.0);
    }

    fn is_interactive(&self) -> bool {
        true
    }

    fn setup(&mut self, _window: Option<&mut dyn Window>, keys: &[String]) {
        if self.keys.is_empty() {
            self.keys = keys.to_vec();
        }
    }

    fn display(
        &mut self,
        window: &mut dyn Window,
        logger: &mut EventLogger,
        ctx: &HookContext<'_>,
    ) -> TaskResult<Option<HookOutcome>> {
        window.present(&Stimulus::new(format!("{}-phase1", self.name), &self.prepare_text));
        window.flip();
        let t0 = logger.now();
        logger.log_event(self.prepare_fields(), None, None)?;
        logger.wait(window, self.prepare_duration, t0)?;

        let flipped = self.draw_flip();
        for (slot, side) in [(0, Side::Left), (1, Side::Right)] {
            if let Some(text) = self.options.get(Self::swap(flipped, slot)) {
                window.present(&Stimulus::new(&self.name, text).at(side));
            }
        }
        window.flip();

        let admitted: Vec<String> = self
            .keys
            .iter()
            .enumerate()
            .filter(|(slot, _)| ctx.is_legal(Self::swap(flipped, *slot)))
            .map(|(_, k)| k.clone())
            .collect();
        let start = logger.now();
        logger.log_event(self.window_fields(flipped), None, None)?;
        let Some(press) = logger.wait_for_key(window, &admitted, self.duration, start)? else {
            let late = logger
                .late_key(window, &admitted)?
                .map(|p| (p.key, p.time - start));
            return self.timeout(logger, ctx, start, late);
        };
        let Some(slot) = self.keys.iter().position(|k| *k == press.key) else {
            return self.timeout(logger, ctx, start, None);
        };
        let action = Self::swap(flipped, slot);
        let rt = (press.time - start).max(0.0);
        logger.log_event(
            EventFields::new("response")
                .response(rt, press.key, false)
                .label(RlLabel::Action)
                .action(ctx.behavioral(action)),
            None,
            Some(press.time),
        )?;

        window.present(&Stimulus::new(
            format!("{}-phase2", self.name),
            self.feedback_text(action),
        ));
        window.flip();
        let t2 = logger.now();
        logger.log_event(self.feedback_fields(action), None, None)?;
        logger.wait(window, self.feedback_duration, t2)?;

        Ok(Some(HookOutcome {
            action,
            remainder: (self.duration - rt).max(0.0),
            timed_out: false,
        }))
    }

    fn simulate(
        &mut self,
        logger: &mut EventLogger,
        response: Option<SimResponse>,
        ctx: &HookContext<'_>,
    ) -> TaskResult<Option<HookOutcome>> {
        logger.log_event(self.prepare_fields(), None, None)?;
        logger.advance(self.prepare_duration);

        let flipped = self.draw_flip();
        let start = logger.now();
        logger.log_event(self.window_fields(flipped), None, None)?;
        let key_for = |action: usize| {
            let slot = Self::swap(flipped, action);
            self.keys
                .get(slot)
                .cloned()
                .unwrap_or_else(|| slot.to_string())
        };

        let Some(r) = response.filter(|r| ctx.is_legal(r.action)) else {
            logger.simulated_key_strokes(f64::INFINITY, self.duration);
            return self.timeout(logger, ctx, start, None);
        };
        if logger.simulated_key_strokes(r.rt, self.duration).is_none() {
            return self.timeout(logger, ctx, start, Some((key_for(r.action), r.rt)));
        }
        logger.log_event(
            EventFields::new("response")
                .response(r.rt, key_for(r.action), false)
                .label(RlLabel::Action)
                .action(ctx.behavioral(r.action)),
            None,
            None,
        )?;
        logger.log_event(self.feedback_fields(r.action), None, None)?;
        logger.advance(self.feedback_duration);

        Ok(Some(HookOutcome {
            action: r.action,
            remainder: (self.duration - r.rt).max(0.0),
            timed_out: false,
        }))
    }
}

// ---------------------------------------------------------------------------
// Declarative specs
// ---------------------------------------------------------------------------

fn default_prepare_text() -> String {
    "+".to_string()
}

/// Serde form of a hook, as written in task manifests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HookSpec {
    Passive {
        name: String,
        duration: f64,
        #[serde(default)]
        text: String,
        #[serde(default)]
        rl_label: Option<RlLabel>,
    },
    Feedback {
        name: String,
        duration: f64,
        #[serde(default)]
        text: String,
    },
    Action {
        name: String,
        duration: f64,
        #[serde(default)]
        text: String,
        #[serde(default)]
        keys: Vec<String>,
        #[serde(default)]
        timeout_action: Option<usize>,
        #[serde(default)]
        too_early: Option<f64>,
    },
    Composite {
        name: String,
        duration: f64,
        options: Vec<String>,
        #[serde(default = "default_prepare_text")]
        prepare_text: String,
        #[serde(default)]
        prepare_duration: f64,
        #[serde(default)]
        feedback: Vec<String>,
        #[serde(default)]
        feedback_duration: f64,
        #[serde(default)]
        keys: Vec<String>,
        #[serde(default)]
        timeout_action: Option<usize>,
        #[serde(default)]
        flip: bool,
    },
}

impl HookSpec {
    pub fn name(&self) -> &str {
        match self {
            HookSpec::Passive { name, .. }
            | HookSpec::Feedback { name, .. }
            | HookSpec::Action { name, .. }
            | HookSpec::Composite { name, .. } => name,
        }
    }

    /// Build the hook. `seed` feeds hooks that draw randomness (flip).
    pub fn build(&self, seed: u64) -> Box<dyn RenderHook> {
        match self.clone() {
            HookSpec::Passive {
                name,
                duration,
                text,
                rl_label,
            } => {
                let mut hook = PassiveHook::new(name, text, duration);
                hook.label = rl_label;
                Box::new(hook)
            }
            HookSpec::Feedback {
                name,
                duration,
                text,
            } => Box::new(FeedbackHook::new(name, text, duration)),
            HookSpec::Action {
                name,
                duration,
                text,
                keys,
                timeout_action,
                too_early,
            } => {
                let mut hook = ActionHook::new(name, duration).with_text(text).with_keys(keys);
                hook.timeout_action = timeout_action;
                hook.too_early = too_early;
                Box::new(hook)
            }
            HookSpec::Composite {
                name,
                duration,
                options,
                prepare_text,
                prepare_duration,
                feedback,
                feedback_duration,
                keys,
                timeout_action,
                flip,
            } => {
                let mut hook = CompositeHook::new(name, options, duration, seed)
                    .with_prepare(prepare_text, prepare_duration)
                    .with_feedback(feedback, feedback_duration)
                    .with_keys(keys)
                    .with_flip(flip);
                hook.timeout_action = timeout_action;
                Box::new(hook)
            }
        }
    }
}
