//! PowerShell command construction.
//!
//! A [`PsCommand`] is built from script fragments and a [`PsCommandOptions`]
//! record. The builder adds the credential preamble and suffix, the
//! `Invoke-Command` wrapper, and the `ConvertTo-Json` pipeline as the options
//! require. Dynamic values reach the script only through the sanitizer,
//! either here (user, password, server) or through [`Cmdlet`].

use std::fmt;
use tracing::{debug, trace};

use super::sanitize::{render_bare_word, render_literal, sanitise_string, CustomAttributes, Scalar};
use crate::connection::{CommandResult, Connection, ConnectionResult, LocalConnection, SessionHandle};

/// Placeholder for the password in logged commands.
pub const REDACTED: &str = "********";

const CREDENTIAL_SUFFIX: &str = " -Credential $Credential";
const JSON_SUFFIX: &str = " | ConvertTo-Json";

/// Options controlling how fragments become a script.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct PsCommandOptions {
    /// Run in a local PowerShell process regardless of the session
    pub exec_locally: bool,
    /// Decode output as a sequence even when one object comes back
    pub force_array: bool,
    /// Wrap the body in `Invoke-Command -Authentication Kerberos`
    pub invoke_command: bool,
    /// Pipe output through `ConvertTo-Json`
    pub json_output: bool,
    /// Build a credential object and pass it to the cmdlet
    pub pass_credentials: bool,
    /// Leave out the credential preamble
    pub skip_cred_prefix: bool,
    /// Leave out `-Credential $Credential`
    pub skip_cred_suffix: bool,
    pub username: String,
    pub password: String,
    /// Target server (`-Server`, or `-Computername` when invoking)
    pub server: String,
}

impl PsCommandOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn json(mut self) -> Self {
        self.json_output = true;
        self
    }

    pub fn force_array(mut self) -> Self {
        self.force_array = true;
        self
    }

    pub fn invoke_command(mut self) -> Self {
        self.invoke_command = true;
        self
    }

    pub fn exec_locally(mut self, local: bool) -> Self {
        self.exec_locally = local;
        self
    }

    /// Pass `username`/`password` as a credential object.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.pass_credentials = true;
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn server(mut self, server: impl Into<String>) -> Self {
        self.server = server.into();
        self
    }

    pub fn skip_cred_prefix(mut self) -> Self {
        self.skip_cred_prefix = true;
        self
    }

    pub fn skip_cred_suffix(mut self) -> Self {
        self.skip_cred_suffix = true;
        self
    }
}

impl fmt::Debug for PsCommandOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PsCommandOptions")
            .field("exec_locally", &self.exec_locally)
            .field("force_array", &self.force_array)
            .field("invoke_command", &self.invoke_command)
            .field("json_output", &self.json_output)
            .field("pass_credentials", &self.pass_credentials)
            .field("skip_cred_prefix", &self.skip_cred_prefix)
            .field("skip_cred_suffix", &self.skip_cred_suffix)
            .field("username", &self.username)
            .field("password", &REDACTED)
            .field("server", &self.server)
            .finish()
    }
}

/// A built script, ready to run.
#[derive(Clone, PartialEq, Eq)]
pub struct PsCommand {
    script: String,
    redacted: String,
    /// Carried for the decoder; does not affect the script text.
    pub force_array: bool,
    pub exec_locally: bool,
}

impl PsCommand {
    /// Join `fragments` with single spaces and apply `opts`.
    pub fn new<I, S>(fragments: I, opts: &PsCommandOptions) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let body = fragments
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(" ");

        Self {
            script: render(&body, opts, &opts.password),
            redacted: render(&body, opts, REDACTED),
            force_array: opts.force_array,
            exec_locally: opts.exec_locally,
        }
    }

    /// The script text sent to the host.
    pub fn as_str(&self) -> &str {
        &self.script
    }

    /// The script with the password replaced, for logging.
    pub fn redacted(&self) -> &str {
        &self.redacted
    }

    /// Run through `handle`, or in a local process when `exec_locally` is set.
    ///
    /// Blocks the calling task until the host reports completion. Transport
    /// failures are returned unchanged; a non-zero exit code is not an error
    /// at this layer.
    pub async fn run(&self, handle: &SessionHandle) -> ConnectionResult<CommandResult> {
        let local = self.exec_locally || handle.is_local();
        debug!(
            host = %handle.connection().identifier(),
            local,
            command = %self.redacted,
            "Running PowerShell command"
        );

        let result = if self.exec_locally && !handle.is_local() {
            LocalConnection::new().execute_powershell(&self.script).await?
        } else {
            handle.connection().execute_powershell(&self.script).await?
        };

        trace!(
            exit_code = result.exit_code,
            stdout_len = result.stdout.len(),
            stderr_len = result.stderr.len(),
            "PowerShell command finished"
        );
        Ok(result)
    }
}

impl fmt::Display for PsCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.script)
    }
}

impl fmt::Debug for PsCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PsCommand")
            .field("script", &self.redacted)
            .field("force_array", &self.force_array)
            .field("exec_locally", &self.exec_locally)
            .finish()
    }
}

fn render(body: &str, opts: &PsCommandOptions, password: &str) -> String {
    let with_prefix = opts.pass_credentials && !opts.skip_cred_prefix;
    let with_suffix = opts.pass_credentials && !opts.skip_cred_suffix;

    let mut script = String::with_capacity(body.len() + 64);

    if opts.invoke_command {
        script.push_str("Invoke-Command -Authentication Kerberos");
        if !opts.server.is_empty() {
            script.push_str(" -Computername ");
            script.push_str(&render_bare_word(&opts.server));
        }
        script.push_str(" -ScriptBlock {");
        script.push_str(body);
        if opts.json_output {
            script.push_str(JSON_SUFFIX);
        }
        script.push('}');
        if with_suffix {
            script.push_str(CREDENTIAL_SUFFIX);
        }
    } else {
        script.push_str(body);
        if with_prefix && !opts.server.is_empty() {
            script.push_str(" -Server ");
            script.push_str(&render_bare_word(&opts.server));
        }
        if with_suffix {
            script.push_str(CREDENTIAL_SUFFIX);
        }
        if opts.json_output {
            script.push_str(JSON_SUFFIX);
        }
    }

    if with_prefix {
        let preamble = format!(
            "$User = \"{}\"\n\
             $Password = ConvertTo-SecureString -String \"{}\" -AsPlainText -Force\n\
             $Credential = New-Object -TypeName System.Management.Automation.PSCredential -ArgumentList $User, $Password\n",
            sanitise_string(&opts.username),
            sanitise_string(password),
        );
        script.insert_str(0, &preamble);
    }

    script
}

/// Builds one cmdlet invocation with sanitized arguments.
///
/// Only `&'static str` text is accepted verbatim; every runtime value goes
/// through [`render_literal`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmdlet {
    parts: Vec<String>,
}

impl Cmdlet {
    pub fn new(name: &'static str) -> Self {
        Self {
            parts: vec![name.to_string()],
        }
    }

    /// `-Name "value"`; booleans render as `-Name:$true`.
    pub fn param(mut self, name: &'static str, value: impl Into<Scalar>) -> Self {
        let part = match value.into() {
            Scalar::Bool(b) => format!("-{}:${}", name, b),
            other => format!("-{} {}", name, render_literal(&other)),
        };
        self.parts.push(part);
        self
    }

    /// `-Name "a","b"`; nothing is added for an empty list.
    pub fn list<S: AsRef<str>>(mut self, name: &'static str, values: &[S]) -> Self {
        if values.is_empty() {
            return self;
        }
        let rendered: Vec<String> = values
            .iter()
            .map(|v| render_literal(&Scalar::from(v.as_ref())))
            .collect();
        self.parts.push(format!("-{} {}", name, rendered.join(",")));
        self
    }

    /// `-Name @{...}` built from custom attributes.
    pub fn attributes(mut self, name: &'static str, attrs: &CustomAttributes) -> Self {
        if !attrs.is_empty() {
            self.parts.push(format!("-{} {}", name, attrs.to_hashtable_literal()));
        }
        self
    }

    /// A bare switch such as `-Recursive`.
    pub fn switch(mut self, name: &'static str) -> Self {
        self.parts.push(format!("-{}", name));
        self
    }

    /// Verbatim script text.
    pub fn raw(mut self, text: &'static str) -> Self {
        self.parts.push(text.to_string());
        self
    }

    /// Pipe into `next`. Server and credential suffixes bind to the last
    /// stage, so only pipe into stages that accept them or run the command
    /// through `Invoke-Command`.
    pub fn pipe(mut self, next: Cmdlet) -> Self {
        self.parts.push("|".to_string());
        self.parts.extend(next.parts);
        self
    }

    pub fn into_fragments(self) -> Vec<String> {
        self.parts
    }
}

impl fmt::Display for Cmdlet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.parts.join(" "))
    }
}
