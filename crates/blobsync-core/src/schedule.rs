//! Registering the job with the host's periodic task facility.
//!
//! Unix hosts get a tagged crontab line; Windows hosts get a Task Scheduler
//! task created through `schtasks`. Either way the installed command is
//! `<current executable> run`, started in the current working directory.

use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::str::FromStr;

use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid interval '{0}': expected e.g. '5 minutes', '2 hours' or '1 day'")]
    InvalidInterval(String),

    #[error("interval {0} cannot be expressed by this scheduler")]
    Unsupported(Interval),

    #[error("`{program}` failed ({status}): {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("failed to run scheduler command: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalUnit {
    Minutes,
    Hours,
    Days,
}

/// How often the job repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub count: u32,
    pub unit: IntervalUnit,
}

impl Interval {
    pub fn minutes(count: u32) -> Self {
        Self {
            count,
            unit: IntervalUnit::Minutes,
        }
        .normalized()
    }

    pub fn as_minutes(&self) -> u64 {
        let count = u64::from(self.count);
        match self.unit {
            IntervalUnit::Minutes => count,
            IntervalUnit::Hours => count * 60,
            IntervalUnit::Days => count * 60 * 24,
        }
    }

    /// Express whole hours/days in the largest unit that divides evenly.
    fn normalized(self) -> Self {
        let minutes = self.as_minutes();
        if minutes % (60 * 24) == 0 {
            Self {
                count: (minutes / (60 * 24)) as u32,
                unit: IntervalUnit::Days,
            }
        } else if minutes % 60 == 0 {
            Self {
                count: (minutes / 60) as u32,
                unit: IntervalUnit::Hours,
            }
        } else {
            self
        }
    }

    /// Five-field cron expression. A `*/N` step restarts at every hour, day or
    /// month boundary, so only counts that divide that cycle fire at a fixed
    /// interval; anything else is refused.
    pub fn cron_expression(&self) -> Result<String, ScheduleError> {
        match self.unit {
            IntervalUnit::Minutes if 60 % self.count == 0 => {
                Ok(format!("*/{} * * * *", self.count))
            }
            IntervalUnit::Hours if 24 % self.count == 0 => Ok(format!("0 */{} * * *", self.count)),
            IntervalUnit::Days if self.count == 1 => Ok("0 0 * * *".to_string()),
            _ => Err(ScheduleError::Unsupported(*self)),
        }
    }

    /// `/SC` and `/MO` arguments for `schtasks /Create`.
    pub fn schtasks_args(&self) -> Result<Vec<String>, ScheduleError> {
        let (schedule, limit) = match self.unit {
            IntervalUnit::Minutes => ("MINUTE", 1439),
            IntervalUnit::Hours => ("HOURLY", 23),
            IntervalUnit::Days => ("DAILY", 365),
        };
        if self.count > limit {
            return Err(ScheduleError::Unsupported(*self));
        }
        Ok(vec![
            "/SC".into(),
            schedule.into(),
            "/MO".into(),
            self.count.to_string(),
        ])
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match self.unit {
            IntervalUnit::Minutes => "minute",
            IntervalUnit::Hours => "hour",
            IntervalUnit::Days => "day",
        };
        let plural = if self.count == 1 { "" } else { "s" };
        write!(f, "{} {unit}{plural}", self.count)
    }
}

impl FromStr for Interval {
    type Err = ScheduleError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let invalid = || ScheduleError::InvalidInterval(input.to_string());
        let trimmed = input.trim();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, unit) = trimmed.split_at(split);

        let count: u32 = digits.parse().map_err(|_| invalid())?;
        if count == 0 {
            return Err(invalid());
        }

        let unit = match unit.trim().to_ascii_lowercase().as_str() {
            "" | "m" | "min" | "mins" | "minute" | "minutes" => IntervalUnit::Minutes,
            "h" | "hour" | "hours" => IntervalUnit::Hours,
            "d" | "day" | "days" => IntervalUnit::Days,
            _ => return Err(invalid()),
        };

        Ok(Self { count, unit }.normalized())
    }
}

/// What the scheduler should start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

impl JobCommand {
    /// `<current executable> run` in the current directory.
    pub fn current() -> Result<Self, ScheduleError> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: vec!["run".into()],
            working_dir: std::env::current_dir()?,
        })
    }
}

pub trait Scheduler {
    fn install(&self, interval: &Interval) -> Result<(), ScheduleError>;
    fn uninstall(&self) -> Result<(), ScheduleError>;
}

/// The backend for the host this binary was built for.
pub fn platform_scheduler(task_name: &str, command: JobCommand) -> Box<dyn Scheduler> {
    if cfg!(windows) {
        Box::new(TaskScheduler::new(task_name, command))
    } else {
        Box::new(Crontab::new(task_name, command))
    }
}

/// Manages a single line in the invoking user's crontab, identified by a
/// trailing `# blobsync:<task>` marker.
#[derive(Debug, Clone)]
pub struct Crontab {
    task_name: String,
    command: JobCommand,
}

impl Crontab {
    pub fn new(task_name: &str, command: JobCommand) -> Self {
        Self {
            task_name: task_name.to_string(),
            command,
        }
    }

    fn marker(&self) -> String {
        format!("# blobsync:{}", self.task_name)
    }

    pub fn entry(&self, interval: &Interval) -> Result<String, ScheduleError> {
        let mut line = format!(
            "{} cd {} && {}",
            interval.cron_expression()?,
            shell_quote(&self.command.working_dir.to_string_lossy()),
            shell_quote(&self.command.program.to_string_lossy()),
        );
        for arg in &self.command.args {
            line.push(' ');
            line.push_str(&shell_quote(arg));
        }
        line.push(' ');
        line.push_str(&self.marker());
        Ok(line)
    }

    /// `existing` without this task's line, plus `entry` if given.
    pub fn render(&self, existing: &str, entry: Option<&str>) -> String {
        let marker = self.marker();
        let mut lines: Vec<&str> = existing
            .lines()
            .filter(|line| !line.trim_end().ends_with(&marker))
            .collect();
        if let Some(entry) = entry {
            lines.push(entry);
        }

        let mut rendered = lines.join("\n");
        if !rendered.is_empty() {
            rendered.push('\n');
        }
        rendered
    }

    fn read_current() -> Result<String, ScheduleError> {
        let output = Command::new("crontab").arg("-l").output()?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("no crontab") {
            return Ok(String::new());
        }
        Err(ScheduleError::Command {
            program: "crontab -l".into(),
            status: output.status.to_string(),
            stderr: stderr.trim().to_string(),
        })
    }

    fn write(contents: &str) -> Result<(), ScheduleError> {
        let mut child = Command::new("crontab")
            .arg("-")
            .stdin(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(contents.as_bytes())?;
        }
        let output = child.wait_with_output()?;
        check_output("crontab -", &output)
    }
}

impl Scheduler for Crontab {
    fn install(&self, interval: &Interval) -> Result<(), ScheduleError> {
        let entry = self.entry(interval)?;
        let current = Self::read_current()?;
        Self::write(&self.render(&current, Some(&entry)))?;
        info!(task = %self.task_name, %interval, "Installed crontab entry");
        Ok(())
    }

    fn uninstall(&self) -> Result<(), ScheduleError> {
        let current = Self::read_current()?;
        Self::write(&self.render(&current, None))?;
        info!(task = %self.task_name, "Removed crontab entry");
        Ok(())
    }
}

/// Windows Task Scheduler via `schtasks.exe`.
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    task_name: String,
    command: JobCommand,
}

impl TaskScheduler {
    pub fn new(task_name: &str, command: JobCommand) -> Self {
        Self {
            task_name: task_name.to_string(),
            command,
        }
    }

    pub fn create_args(&self, interval: &Interval) -> Result<Vec<String>, ScheduleError> {
        let mut action = format!(
            "cmd /c cd /d \"{}\" && \"{}\"",
            self.command.working_dir.display(),
            self.command.program.display()
        );
        for arg in &self.command.args {
            action.push(' ');
            action.push_str(arg);
        }

        let mut args = vec![
            "/Create".to_string(),
            "/TN".into(),
            self.task_name.clone(),
            "/TR".into(),
            action,
        ];
        args.extend(interval.schtasks_args()?);
        args.push("/F".into());
        Ok(args)
    }

    pub fn delete_args(&self) -> Vec<String> {
        vec![
            "/Delete".into(),
            "/TN".into(),
            self.task_name.clone(),
            "/F".into(),
        ]
    }
}

impl Scheduler for TaskScheduler {
    fn install(&self, interval: &Interval) -> Result<(), ScheduleError> {
        let output = Command::new("schtasks")
            .args(self.create_args(interval)?)
            .output()?;
        check_output("schtasks /Create", &output)?;
        info!(task = %self.task_name, %interval, "Registered scheduled task");
        Ok(())
    }

    fn uninstall(&self) -> Result<(), ScheduleError> {
        let output = Command::new("schtasks").args(self.delete_args()).output()?;
        check_output("schtasks /Delete", &output)?;
        info!(task = %self.task_name, "Deleted scheduled task");
        Ok(())
    }
}

fn check_output(program: &str, output: &std::process::Output) -> Result<(), ScheduleError> {
    if output.status.success() {
        return Ok(());
    }
    Err(ScheduleError::Command {
        program: program.to_string(),
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+=:".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command() -> JobCommand {
        JobCommand {
            program: PathBuf::from("/opt/blobsync/bin/blobsync"),
            args: vec!["run".into()],
            working_dir: PathBuf::from("/var/lib/etl job"),
        }
    }

    #[test]
    fn intervals_parse_human_forms() {
        assert_eq!("5 minutes".parse::<Interval>().unwrap(), Interval::minutes(5));
        assert_eq!("15".parse::<Interval>().unwrap(), Interval::minutes(15));
        assert_eq!("2 Hours".parse::<Interval>().unwrap().as_minutes(), 120);
        assert_eq!("1 day".parse::<Interval>().unwrap().unit, IntervalUnit::Days);
        assert!("0 minutes".parse::<Interval>().is_err());
        assert!("every minute".parse::<Interval>().is_err());
        assert!("5 weeks".parse::<Interval>().is_err());
    }

    #[test]
    fn minute_counts_normalise_to_larger_units() {
        assert_eq!(
            Interval::minutes(120),
            Interval {
                count: 2,
                unit: IntervalUnit::Hours
            }
        );
        assert_eq!(Interval::minutes(1440).unit, IntervalUnit::Days);
        assert_eq!(Interval::minutes(90).unit, IntervalUnit::Minutes);
    }

    #[test]
    fn cron_expressions() {
        assert_eq!(Interval::minutes(5).cron_expression().unwrap(), "*/5 * * * *");
        assert_eq!(Interval::minutes(180).cron_expression().unwrap(), "0 */3 * * *");
        assert_eq!(Interval::minutes(1440).cron_expression().unwrap(), "0 0 * * *");
        assert!(matches!(
            Interval::minutes(90).cron_expression(),
            Err(ScheduleError::Unsupported(_))
        ));
    }

    #[test]
    fn cron_refuses_steps_that_drift_across_the_cycle() {
        for every in ["45 minutes", "7 minutes", "5 hours", "2 days"] {
            let interval: Interval = every.parse().unwrap();
            assert!(
                matches!(interval.cron_expression(), Err(ScheduleError::Unsupported(_))),
                "{every} should not map to a cron step"
            );
        }
        let quarter: Interval = "15 minutes".parse().unwrap();
        assert_eq!(quarter.cron_expression().unwrap(), "*/15 * * * *");
        let eight_hours: Interval = "8 hours".parse().unwrap();
        assert_eq!(eight_hours.cron_expression().unwrap(), "0 */8 * * *");
    }

    #[test]
    fn crontab_render_replaces_only_the_tagged_line() {
        let crontab = Crontab::new("run_etl_job", command());
        let entry = crontab.entry(&Interval::minutes(5)).unwrap();
        assert_eq!(
            entry,
            "*/5 * * * * cd '/var/lib/etl job' && /opt/blobsync/bin/blobsync run # blobsync:run_etl_job"
        );

        let existing = "0 1 * * * backup.sh\n*/10 * * * * old # blobsync:run_etl_job\n";
        let rendered = crontab.render(existing, Some(&entry));
        assert_eq!(rendered, format!("0 1 * * * backup.sh\n{entry}\n"));

        assert_eq!(crontab.render(&rendered, None), "0 1 * * * backup.sh\n");
        assert_eq!(crontab.render("", None), "");
    }

    #[test]
    fn schtasks_arguments() {
        let scheduler = TaskScheduler::new("run_etl_job", command());
        let args = scheduler.create_args(&Interval::minutes(5)).unwrap();
        assert_eq!(&args[..3], ["/Create", "/TN", "run_etl_job"]);
        assert!(args[4].ends_with("\"/opt/blobsync/bin/blobsync\" run"));
        assert_eq!(&args[5..], ["/SC", "MINUTE", "/MO", "5", "/F"]);
        assert_eq!(
            scheduler.delete_args(),
            vec!["/Delete", "/TN", "run_etl_job", "/F"]
        );
    }

    #[test]
    fn shell_quoting() {
        assert_eq!(shell_quote("/usr/bin/blobsync"), "/usr/bin/blobsync");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }
}
