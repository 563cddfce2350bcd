//! Transport launchers.
//!
//! A transport is nothing more than a command-line vector that ends up
//! executing a `lariat-agent` binary with its stdin and stdout connected
//! to the controller. The launchers here cover the usual child-process
//! transports; anything else can be expressed with [`Launch::command_vec`].

use std::process::Stdio;

use tokio::process::Command;

/// Name of the agent binary looked up on the remote `PATH` by default.
pub const DEFAULT_AGENT: &str = "lariat-agent";

/// How to start the child process carrying a tunnel.
#[derive(Debug, Clone)]
pub struct Launch {
    /// Transport argv prefix (`ssh ...`, `sudo ...`, empty for local).
    prefix: Vec<String>,
    /// Argv that runs the agent at the far end.
    agent: Vec<String>,
    /// Whether the child can be signalled from this user. `sudo`
    /// children cannot, so closing them relies on EOF alone.
    can_signal: bool,
}

impl Launch {
    /// Runs the agent directly as a local child process.
    pub fn local() -> Self {
        Self {
            prefix: Vec::new(),
            agent: vec![DEFAULT_AGENT.to_owned()],
            can_signal: true,
        }
    }

    /// Connects over `ssh` with password authentication disabled, so a
    /// missing key fails fast instead of prompting.
    pub fn ssh(host: &str, user: Option<&str>) -> Self {
        let mut prefix = vec![
            "ssh".to_owned(),
            "-o".to_owned(),
            "PasswordAuthentication=no".to_owned(),
        ];
        if let Some(user) = user {
            prefix.push("-l".to_owned());
            prefix.push(user.to_owned());
        }
        prefix.push(host.to_owned());
        Self {
            prefix,
            agent: vec![DEFAULT_AGENT.to_owned()],
            can_signal: true,
        }
    }

    /// Starts a fresh container from `image` and runs the agent inside it.
    pub fn docker(name: &str, image: &str, rm: bool) -> Self {
        let mut prefix = vec!["docker".to_owned(), "run".to_owned(), "-i".to_owned()];
        if rm {
            prefix.push("--rm".to_owned());
        }
        prefix.push("--name".to_owned());
        prefix.push(name.to_owned());
        prefix.push(image.to_owned());
        Self {
            prefix,
            agent: vec![DEFAULT_AGENT.to_owned()],
            can_signal: true,
        }
    }

    /// Runs the agent as another user via non-interactive `sudo`.
    pub fn sudo(user: &str) -> Self {
        Self {
            prefix: vec![
                "sudo".to_owned(),
                "--non-interactive".to_owned(),
                "-u".to_owned(),
                user.to_owned(),
            ],
            agent: vec![DEFAULT_AGENT.to_owned()],
            can_signal: false,
        }
    }

    /// An arbitrary transport argv; `argv` must produce an agent on the
    /// far end of the pipe.
    pub fn command_vec(argv: Vec<String>, can_signal: bool) -> Self {
        Self {
            prefix: argv,
            agent: Vec::new(),
            can_signal,
        }
    }

    /// Overrides the agent argv appended after the transport prefix.
    #[must_use]
    pub fn agent_argv(mut self, argv: Vec<String>) -> Self {
        self.agent = argv;
        self
    }

    /// Whether the spawned child can be killed from this process.
    pub const fn can_signal(&self) -> bool {
        self.can_signal
    }

    /// The full argv this launch runs.
    pub fn argv(&self) -> Vec<String> {
        self.prefix.iter().chain(self.agent.iter()).cloned().collect()
    }

    /// Builds the child-process command with all three streams piped.
    pub fn command(&self) -> Command {
        let argv = self.argv();
        let program = argv.first().map_or(DEFAULT_AGENT, String::as_str);
        let mut cmd = Command::new(program);
        cmd.args(argv.iter().skip(1))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}
