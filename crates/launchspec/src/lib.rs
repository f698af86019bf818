//! Normalizes an incoming [`recordio::LaunchRecord`] into a single,
//! runtime-agnostic [`LaunchSpec`].
//!
//! A launch record arrives in one of two shapes: a task with its own
//! command (no framework executor -- the adapter must also run a process
//! standing in for the executor, see the `observe` verb) or a task handed
//! off to a framework executor's command (the executor runs inside the
//! container itself). This crate collapses both into one normalized shape
//! so the rest of the adapter never has to branch on which one it got.
//!
//! Grounded on `examples/original_source/deimos/mesos.py` and
//! `examples/original_source/deimos/containerizer/docker.py`'s
//! `determine_image`/image-url handling.

mod error;

pub use error::Error;

use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use recordio::{CommandInfo, LaunchRecord, Resources, UriSpec};

#[derive(Builder, Clone, Debug, Getters, CopyGetters)]
#[builder(pattern = "owned", setter(into))]
pub struct LaunchSpec {
    #[get = "pub"]
    container_id: String,

    #[get = "pub"]
    executor_id: String,

    /// Whether the task came with no framework executor, meaning this
    /// adapter must spawn its own observer process standing in for one.
    #[get_copy = "pub"]
    needs_observer: bool,

    /// The `docker:///...` image reference as given, or empty if the
    /// descriptor didn't specify one (the containerizer then falls back to
    /// its configured default image).
    #[get = "pub"]
    image_url: String,

    #[get = "pub"]
    image_options: Vec<String>,

    #[get = "pub"]
    argv: Vec<String>,

    #[get = "pub"]
    env: Vec<(String, String)>,

    #[get = "pub"]
    uris: Vec<UriSpec>,

    #[get = "pub"]
    ports: Vec<u32>,

    #[get_copy = "pub"]
    #[builder(default)]
    cpu_shares: Option<i64>,

    #[get = "pub"]
    #[builder(default)]
    mem: Option<String>,

    #[get = "pub"]
    #[builder(default)]
    directory: Option<String>,

    #[get = "pub"]
    #[builder(default)]
    user: Option<String>,
}

/// Normalize a `LaunchRecord` into a `LaunchSpec`.
pub fn normalize(record: &LaunchRecord) -> Result<LaunchSpec, Error> {
    let (command, resources, needs_observer) = match (&record.executor_command, &record.task_command) {
        (Some(cmd), _) => (cmd, &record.executor_resources, false),
        (None, Some(cmd)) => (cmd, &record.task_resources, true),
        (None, None) => return Err(Error::MissingCommand),
    };

    let executor_id = record
        .executor_id
        .clone()
        .unwrap_or_else(|| record.container_id.clone());

    let image_url = command.container_image.clone().unwrap_or_default();
    let (options, argv_override) = split_on_double_slash(&command.container_options);
    let argv = argv_override.unwrap_or_else(|| default_argv(command));

    let mut env: Vec<(String, String)> = command.environment.iter().map(|e| (e.name.clone(), e.value.clone())).collect();
    if let Some(name) = &record.task_name {
        env.push(("TASK_INFO".into(), name.clone()));
    }

    let ports = flatten_ports(resources);
    let (cpu_shares, mem) = scale_resources(resources);

    Ok(LaunchSpecBuilder::default()
        .container_id(record.container_id.clone())
        .executor_id(executor_id)
        .needs_observer(needs_observer)
        .image_url(image_url)
        .image_options(options)
        .argv(argv)
        .env(env)
        .uris(command.uris.clone())
        .ports(ports)
        .cpu_shares(cpu_shares)
        .mem(mem)
        .directory(record.directory.clone())
        .user(record.user.clone())
        .build()
        .expect("all required LaunchSpec fields are set above"))
}

fn default_argv(command: &CommandInfo) -> Vec<String> {
    match &command.value {
        Some(value) if !command.shell => {
            let mut argv = vec![value.clone()];
            argv.extend(command.arguments.iter().cloned());
            argv
        }
        Some(value) => vec!["/bin/sh".into(), "-c".into(), value.clone()],
        None => command.arguments.clone(),
    }
}

/// Parse a `docker:///<image>` or `docker://<image>` reference into the bare
/// image name. Any other scheme is an error.
pub fn url_to_image(url: &str) -> Result<String, Error> {
    for prefix in ["docker:///", "docker://"] {
        if let Some(rest) = url.strip_prefix(prefix) {
            return Ok(rest.to_string());
        }
    }
    Err(Error::InvalidImageUrl(url.to_string()))
}

/// Split container options on a literal `//` token: anything after it is a
/// replacement argv overriding the descriptor's own command, anything
/// before it is passed straight through to the runtime as run options.
fn split_on_double_slash(options: &[String]) -> (Vec<String>, Option<Vec<String>>) {
    match options.iter().position(|o| o == "//") {
        Some(idx) => (options[..idx].to_vec(), Some(options[idx + 1..].to_vec())),
        None => (options.to_vec(), None),
    }
}

fn flatten_ports(resources: &Resources) -> Vec<u32> {
    let mut ports = Vec::new();
    for range in &resources.ports {
        ports.extend(range.begin..=range.end);
    }
    ports
}

/// CPU shares = round(cpus * 1024); memory argument = round(mem MiB) with a
/// trailing `m` suffix, the units `docker run -c`/`-m` expect.
fn scale_resources(resources: &Resources) -> (Option<i64>, Option<String>) {
    let shares = resources.cpus.map(|c| (c * 1024.0).round() as i64);
    let mem = resources.mem_mb.map(|m| format!("{}m", m.round() as i64));
    (shares, mem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use recordio::{EnvVar, PortRange};

    fn task_command(image: &str, options: Vec<String>) -> CommandInfo {
        CommandInfo {
            value: Some("/bin/echo".into()),
            arguments: vec!["hi".into()],
            shell: false,
            container_image: Some(image.into()),
            container_options: options,
            uris: vec![],
            environment: vec![EnvVar {
                name: "FOO".into(),
                value: "bar".into(),
            }],
        }
    }

    fn record(command: CommandInfo, resources: Resources) -> LaunchRecord {
        LaunchRecord {
            container_id: "ct-1".into(),
            task_name: Some("my-task".into()),
            user: None,
            directory: Some("/mnt/mesos/sandbox".into()),
            executor_id: None,
            executor_command: None,
            executor_resources: Resources::default(),
            task_command: Some(command),
            task_resources: resources,
        }
    }

    #[test]
    fn normalizes_a_task_without_an_executor() -> Result<()> {
        let resources = Resources {
            cpus: Some(0.5),
            mem_mb: Some(256.0),
            ports: vec![PortRange { begin: 31000, end: 31001 }],
        };
        let spec = normalize(&record(task_command("docker:///alpine:3.18", vec![]), resources))?;
        assert!(spec.needs_observer());
        assert_eq!(spec.image_url(), "docker:///alpine:3.18");
        assert_eq!(spec.argv(), &vec!["/bin/echo".to_string(), "hi".to_string()]);
        assert_eq!(spec.cpu_shares(), Some(512));
        assert_eq!(spec.mem(), &Some("256m".to_string()));
        assert_eq!(spec.ports(), &vec![31000, 31001]);
        assert!(spec.env().iter().any(|(k, v)| k == "TASK_INFO" && v == "my-task"));
        Ok(())
    }

    #[test]
    fn splits_argv_override_on_double_slash() -> Result<()> {
        let options = vec!["--net=host".to_string(), "//".to_string(), "sleep".to_string(), "5".to_string()];
        let spec = normalize(&record(task_command("docker:///alpine:3.18", options), Resources::default()))?;
        assert_eq!(spec.image_options(), &vec!["--net=host".to_string()]);
        assert_eq!(spec.argv(), &vec!["sleep".to_string(), "5".to_string()]);
        Ok(())
    }

    #[test]
    fn missing_command_is_an_error() {
        let record = LaunchRecord {
            container_id: "ct-2".into(),
            task_name: None,
            user: None,
            directory: None,
            executor_id: None,
            executor_command: None,
            executor_resources: Resources::default(),
            task_command: None,
            task_resources: Resources::default(),
        };
        assert!(matches!(normalize(&record), Err(Error::MissingCommand)));
    }

    #[test]
    fn parses_docker_url_variants() {
        assert_eq!(url_to_image("docker:///alpine:3.18").unwrap(), "alpine:3.18");
        assert_eq!(url_to_image("docker://alpine:3.18").unwrap(), "alpine:3.18");
        assert!(url_to_image("https://example.com/alpine").is_err());
    }
}
