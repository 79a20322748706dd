use std::{
    collections::BTreeMap,
    env,
    fmt::{self, Display},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use super::{Result, SpecErr};

/// The role a process plays inside the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Master,
    Worker,
    Ps,
}

impl TaskType {
    /// Returns the job name used in device strings and cluster maps.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Master => "master",
            TaskType::Worker => "worker",
            TaskType::Ps => "ps",
        }
    }
}

impl FromStr for TaskType {
    type Err = SpecErr;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "master" => Ok(Self::Master),
            "worker" => Ok(Self::Worker),
            "ps" => Ok(Self::Ps),
            other => Err(SpecErr::InvalidTaskType(other.to_string())),
        }
    }
}

impl Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies this process inside the cluster. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTask")]
pub struct TaskSpec {
    #[serde(rename = "type")]
    task_type: TaskType,
    index: usize,
}

impl TaskSpec {
    /// Creates a new `TaskSpec`.
    ///
    /// # Arguments
    /// * `task_type` - The role of this task.
    /// * `index` - The position of this task inside its job.
    ///
    /// # Returns
    /// The spec, or `SpecErr::SecondMaster` when asked for a master replica other than 0.
    pub fn new(task_type: TaskType, index: usize) -> Result<Self> {
        if task_type == TaskType::Master && index > 0 {
            return Err(SpecErr::SecondMaster { index });
        }

        Ok(Self { task_type, index })
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether this task is the chief, the sole `master` replica.
    pub fn is_master(&self) -> bool {
        self.task_type == TaskType::Master && self.index == 0
    }
}

impl Default for TaskSpec {
    fn default() -> Self {
        Self {
            task_type: TaskType::Master,
            index: 0,
        }
    }
}

/// Formats the task as `/job:<type>/task:<index>`, the prefix of every log line.
impl Display for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/job:{}/task:{}", self.task_type, self.index)
    }
}

/// Maps every job to the ordered list of its task addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterSpec {
    jobs: BTreeMap<TaskType, Vec<String>>,
}

impl ClusterSpec {
    /// Creates a new `ClusterSpec`.
    ///
    /// # Arguments
    /// * `jobs` - The addresses of every task, grouped by job.
    ///
    /// # Returns
    /// The spec or `SpecErr::TooManyMasters` if more than one master address is declared.
    pub fn new(jobs: BTreeMap<TaskType, Vec<String>>) -> Result<Self> {
        let masters = jobs.get(&TaskType::Master).map(Vec::len).unwrap_or_default();
        if masters > 1 {
            return Err(SpecErr::TooManyMasters { got: masters });
        }

        Ok(Self { jobs })
    }

    /// Returns the addresses of every task in `job`, empty if the job isn't declared.
    pub fn tasks(&self, job: TaskType) -> &[String] {
        self.jobs.get(&job).map(Vec::as_slice).unwrap_or_default()
    }

    /// Resolves the network address of `task`.
    ///
    /// # Returns
    /// The address or an error if the job or the index doesn't exist.
    pub fn addr(&self, task: &TaskSpec) -> Result<&str> {
        let job = task.task_type();
        let tasks = self
            .jobs
            .get(&job)
            .ok_or_else(|| SpecErr::UnknownJob(job.to_string()))?;

        tasks
            .get(task.index())
            .map(String::as_str)
            .ok_or_else(|| SpecErr::TaskIndexOutOfRange {
                job: job.to_string(),
                index: task.index(),
                len: tasks.len(),
            })
    }

    /// Returns the amount of parameter server tasks.
    pub fn num_ps(&self) -> usize {
        self.tasks(TaskType::Ps).len()
    }
}

#[derive(Deserialize)]
struct RawTask {
    #[serde(rename = "type")]
    task_type: Option<String>,
    index: Option<usize>,
}

impl TryFrom<RawTask> for TaskSpec {
    type Error = SpecErr;

    fn try_from(raw: RawTask) -> Result<Self> {
        let task_type = raw.task_type.ok_or(SpecErr::MissingTaskType)?.parse()?;
        let index = raw.index.ok_or(SpecErr::MissingTaskIndex)?;
        TaskSpec::new(task_type, index)
    }
}

#[derive(Deserialize)]
struct RawConfig {
    cluster: Option<BTreeMap<String, Vec<String>>>,
    task: Option<RawTask>,
}

/// The externally supplied cluster environment of a process.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClusterConfig {
    pub cluster: Option<ClusterSpec>,
    pub task: TaskSpec,
}

impl ClusterConfig {
    /// Parses the `{"cluster": {...}, "task": {"type": ..., "index": ...}}` document.
    ///
    /// An absent or empty `cluster` means local execution and an absent `task`
    /// defaults to the master replica.
    ///
    /// # Arguments
    /// * `json` - The raw configuration.
    ///
    /// # Returns
    /// The parsed configuration or a `SpecErr`.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawConfig =
            serde_json::from_str(json).map_err(|e| SpecErr::Malformed(e.to_string()))?;

        let cluster = match raw.cluster {
            Some(jobs) if !jobs.is_empty() => {
                let jobs = jobs
                    .into_iter()
                    .map(|(job, addrs)| Ok((job.parse()?, addrs)))
                    .collect::<Result<_>>()?;

                Some(ClusterSpec::new(jobs)?)
            }
            _ => None,
        };

        let task = match raw.task {
            None => TaskSpec::default(),
            Some(raw) => raw.try_into()?,
        };

        Ok(Self { cluster, task })
    }

    /// Reads the configuration from the environment variable `var`, an unset
    /// variable is the same as an empty document.
    pub fn from_env(var: &str) -> Result<Self> {
        match env::var(var) {
            Ok(json) => Self::from_json(&json),
            Err(_) => Self::from_json("{}"),
        }
    }
}
