// src/runner.rs
//
// Per-trial driver.
//
// For each scheduled trial:
// 1. apply the trial's hook-duration overrides (and the staircase target);
// 2. reset the environment at the scheduled start under the trial's condition;
// 3. step until a terminal is reached, feeding hook actions back in and
//    updating the agent after every step;
// 4. on a missing response show a "respond faster" reminder and mark the
//    trial aborted;
// 5. wait out the response remainder if the schedule asks for it;
// 6. log `trial-end` with the cumulative reward, update the staircase, and
//    insert a break after break-point trials.
//
// The same loop serves humans (window, real time) and agents (virtual time).
// Trial-local errors abort only the trial; everything else aborts the run.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentResponder};
use crate::config::{RunConfig, RunMode};
use crate::engine::{Driver, TaskEnv};
use crate::error::{TaskError, TaskResult};
use crate::event_log::{EventFields, EventLogger};
use crate::schedule::{Trial, TrialSchedule};
use crate::staircase::Staircase;
use crate::tasks::TaskBundle;
use crate::window::{Stimulus, Window};

/// Who is producing the actions.
pub enum Frontend<'a> {
    Live(&'a mut dyn Window),
    Agent(&'a mut dyn Agent),
}

impl Frontend<'_> {
    pub fn mode(&self) -> RunMode {
        match self {
            Frontend::Live(_) => RunMode::Live,
            Frontend::Agent(_) => RunMode::Simulated,
        }
    }
}

/// Build the engine driver for one call.
fn with_driver<R>(frontend: &mut Frontend<'_>, f: impl FnOnce(&mut Driver<'_>) -> R) -> R {
    match frontend {
        Frontend::Live(window) => f(&mut Driver::Display(&mut **window)),
        Frontend::Agent(agent) => {
            let mut responder = AgentResponder::new(&mut **agent);
            f(&mut Driver::Simulate(&mut responder))
        }
    }
}

/// Let `seconds` pass: frame-paced with key polling live, a clock jump simulated.
fn pause(frontend: &mut Frontend<'_>, logger: &mut EventLogger, seconds: f64) -> TaskResult<()> {
    match frontend {
        Frontend::Live(window) => {
            let start = logger.now();
            logger.wait(&mut **window, seconds, start)
        }
        Frontend::Agent(_) => {
            logger.advance(seconds);
            Ok(())
        }
    }
}

/// Participant/run identity repeated on every log row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunIdentity {
    pub participant: String,
    pub run: String,
    pub session: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Completed,
    /// No action came back from a non-terminal state.
    NoResponse,
    /// A trial-local error (e.g. an unknown condition at a terminal).
    Failed,
}

impl TrialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrialStatus::Completed => "completed",
            TrialStatus::NoResponse => "no-response",
            TrialStatus::Failed => "failed",
        }
    }
}

/// Aggregate outcome of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub trials_completed: usize,
    pub trials_aborted: usize,
    pub breaks: usize,
    pub total_reward: f64,
    /// Staircase target at the end of the run, if the task has one.
    pub final_target_duration: Option<f64>,
}

pub struct TaskRunner {
    env: TaskEnv,
    schedule: TrialSchedule,
    keys: Vec<String>,
    staircase: Option<Staircase>,
    identity: RunIdentity,
    reminder_duration: f64,
}

impl TaskRunner {
    pub fn new(
        env: TaskEnv,
        schedule: TrialSchedule,
        keys: Vec<String>,
        staircase: Option<Staircase>,
        config: &RunConfig,
    ) -> TaskResult<Self> {
        schedule.validate()?;
        Ok(Self {
            env,
            schedule,
            keys,
            staircase,
            identity: RunIdentity::default(),
            reminder_duration: config.reminder_duration,
        })
    }

    /// Build the environment from a task bundle.
    pub fn from_bundle(
        bundle: TaskBundle,
        schedule: TrialSchedule,
        config: &RunConfig,
    ) -> TaskResult<Self> {
        let (env, keys, staircase) = bundle.into_env(config.seed)?;
        Self::new(env, schedule, keys, staircase, config)
    }

    pub fn with_identity(mut self, identity: RunIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn env(&self) -> &TaskEnv {
        &self.env
    }

    pub fn schedule(&self) -> &TrialSchedule {
        &self.schedule
    }

    pub fn staircase(&self) -> Option<&Staircase> {
        self.staircase.as_ref()
    }

    /// Run every scheduled trial.
    ///
    /// Returns `RunAborted` if the kill-switch is pressed; the log is closed
    /// by then.
    pub fn run(
        &mut self,
        logger: &mut EventLogger,
        frontend: &mut Frontend<'_>,
    ) -> TaskResult<RunStats> {
        match frontend {
            Frontend::Live(window) => self.env.setup_hooks(Some(&mut **window), &self.keys),
            Frontend::Agent(_) => self.env.setup_hooks(None, &self.keys),
        }
        {
            let info = logger.trial_info_mut();
            info.task = Some(self.schedule.name.clone());
            info.run = Some(self.identity.run.clone());
            info.participant_id = Some(self.identity.participant.clone());
        }
        info!(
            task = %self.schedule.name,
            participant = %self.identity.participant,
            run = %self.identity.run,
            ntrials = self.schedule.ntrials,
            mode = frontend.mode().as_str(),
            "run start"
        );

        let mut stats = RunStats::default();
        let trials: Vec<Trial> = self.schedule.trials().collect();
        for trial in &trials {
            let status = self.run_trial(trial, logger, frontend)?;
            match status {
                TrialStatus::Completed => stats.trials_completed += 1,
                _ => stats.trials_aborted += 1,
            }

            if trial.break_after {
                let duration = self.schedule.break_duration;
                info!(trial = trial.index, duration, "break");
                if let Frontend::Live(window) = frontend {
                    window.present(&Stimulus::new("break", "Take a short break"));
                    window.flip();
                }
                logger.log_event(EventFields::new("break").expected(duration), None, None)?;
                pause(frontend, logger, duration)?;
                stats.breaks += 1;
            }
        }

        stats.total_reward = self.env.total_reward();
        stats.final_target_duration = self.staircase.as_ref().map(|s| s.duration);
        info!(
            completed = stats.trials_completed,
            aborted = stats.trials_aborted,
            total_reward = stats.total_reward,
            "run end"
        );
        Ok(stats)
    }

    fn run_trial(
        &mut self,
        trial: &Trial,
        logger: &mut EventLogger,
        frontend: &mut Frontend<'_>,
    ) -> TaskResult<TrialStatus> {
        for (name, seconds) in &trial.durations {
            if self.env.set_hook_duration(name, *seconds) == 0 {
                debug!(hook = %name, "no hook to update");
            }
        }
        if let Some(s) = &self.staircase {
            self.env.set_hook_duration(&s.hook, s.duration);
        }

        logger.set_trial_time();
        {
            let info = logger.trial_info_mut();
            info.trial = Some(trial.index);
            info.trial_type = Some(trial.condition.to_string());
            info.start_position = Some(trial.start);
            info.current_location = Some(trial.start);
        }
        debug!(trial = trial.index, condition = %trial.condition, start = trial.start, "trial start");

        let status = match self.play(trial, logger, frontend) {
            Ok(status) => status,
            Err(e) if e.is_trial_local() => {
                warn!(trial = trial.index, error = %e, "trial aborted");
                logger.log_event(
                    EventFields::new("trial-aborted").misc(e.to_string()),
                    None,
                    None,
                )?;
                TrialStatus::Failed
            }
            Err(e) => return Err(e),
        };

        if status == TrialStatus::NoResponse {
            warn!(trial = trial.index, "no response");
            if let Frontend::Live(window) = frontend {
                window.present(&Stimulus::new("respond-faster", "Please respond faster"));
                window.flip();
            }
            logger.log_event(
                EventFields::new("respond-faster").expected(self.reminder_duration),
                None,
                None,
            )?;
            pause(frontend, logger, self.reminder_duration)?;
        }

        let remainder = self.env.remainder();
        if self.schedule.add_remainder && remainder > 0.0 {
            logger.log_event(EventFields::new("remainder").expected(remainder), None, None)?;
            pause(frontend, logger, remainder)?;
        }

        logger.log_event(
            EventFields::new("trial-end").misc(status.as_str()),
            Some(self.env.total_reward()),
            None,
        )?;

        if let Some(s) = self.staircase.as_mut() {
            let hit = status == TrialStatus::Completed && !self.env.episode().timed_out;
            if let Some(d) = s.record(&trial.condition, hit) {
                info!(trial = trial.index, duration = d, "staircase adjusted");
            }
        }
        Ok(status)
    }

    fn play(
        &mut self,
        trial: &Trial,
        logger: &mut EventLogger,
        frontend: &mut Frontend<'_>,
    ) -> TaskResult<TrialStatus> {
        let env = &mut self.env;
        let (mut obs, info) =
            with_driver(frontend, |d| env.reset(trial.start, &trial.condition, logger, d))?;
        if env.graph().is_terminal(obs) {
            return Ok(TrialStatus::Completed);
        }
        let Some(mut action) = info.action else {
            return Ok(TrialStatus::NoResponse);
        };

        // Acyclic graphs bound the walk; the cap guards hand-built ones.
        let max_steps = env.graph().n_states() + 1;
        for _ in 0..max_steps {
            let r = with_driver(frontend, |d| env.step(action, logger, d))?;
            if let Frontend::Agent(agent) = frontend {
                agent.update(obs, action, r.reward, r.terminated, r.obs);
            }
            if r.terminated {
                return Ok(TrialStatus::Completed);
            }
            match r.info.action {
                Some(next) => action = next,
                None => return Ok(TrialStatus::NoResponse),
            }
            obs = r.obs;
        }
        Err(TaskError::graph(format!(
            "trial {} did not terminate within {max_steps} steps",
            trial.index
        )))
    }
}
