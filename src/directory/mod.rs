//! Directory access over a session pool.
//!
//! [`DirectoryClient`] is the boundary collaborators use: it checks sessions
//! in and out of the pool, builds commands with the credential and server
//! options the settings call for, runs them, and turns the result into
//! typed records or a classified [`Error`].

pub mod models;

use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::config::Settings;
use crate::connection::{CommandResult, SessionHandle, SessionPool};
use crate::error::{Error, ErrorKind, Result};
use crate::powershell::{cli_xml_errors, decode_cli_xml, decode_output, Cmdlet, Decoded, PsCommand, PsCommandOptions};

pub use models::{
    parent_dn, Computer, GpLink, Gpo, GpoStatus, Group, GroupCategory, GroupMember, GroupMembership, GroupScope,
    OrgUnit, Sid, User,
};

/// Decoded output of a successful command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput<T> {
    pub records: Decoded<T>,
    /// Raw error stream; may hold warnings even on success
    pub stderr: String,
    pub exit_code: i32,
}

/// Runs directory queries against one domain.
#[derive(Debug)]
pub struct DirectoryClient {
    settings: Arc<Settings>,
    pool: SessionPool,
}

impl DirectoryClient {
    /// Validate `settings` and create a client with its own pool.
    ///
    /// No connection is opened until the first command runs.
    pub fn new(settings: Settings) -> Result<Self> {
        settings.validate()?;
        let settings = Arc::new(settings);
        let pool = SessionPool::new(Arc::clone(&settings));
        Ok(Self { settings, pool })
    }

    /// Create a client around an existing pool.
    pub fn with_pool(settings: Arc<Settings>, pool: SessionPool) -> Self {
        Self { settings, pool }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub async fn acquire_session(&self) -> Result<SessionHandle> {
        Ok(self.pool.acquire().await?)
    }

    pub fn release_session(&self, handle: SessionHandle) {
        self.pool.release(handle);
    }

    /// Command options derived from the settings.
    ///
    /// Credentials are passed only when enabled over HTTPS; the target server
    /// is the configured controller or domain.
    pub fn command_options(&self) -> PsCommandOptions {
        let mut opts = PsCommandOptions::new()
            .exec_locally(self.pool.is_local())
            .server(self.settings.identify_domain_controller());
        if self.settings.is_pass_credentials_enabled() {
            opts = opts.credentials(
                self.settings.winrm_username.clone(),
                self.settings.winrm_password.clone(),
            );
        }
        opts
    }

    /// Run a command and return its raw result. A non-zero exit code is not
    /// treated as an error here.
    pub async fn execute_raw<I, S>(&self, fragments: I, opts: &PsCommandOptions) -> Result<CommandResult>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let cmd = PsCommand::new(fragments, opts);
        let handle = self.acquire_session().await?;

        match cmd.run(&handle).await {
            Ok(result) => {
                self.release_session(handle);
                Ok(result)
            }
            Err(e) => {
                // Dropping the handle frees its slot without returning the
                // session for reuse.
                warn!(host = %handle.connection().identifier(), error = %e, "Discarding session after failure");
                drop(handle);
                Err(e.into())
            }
        }
    }

    /// Run a command and decode its JSON output.
    ///
    /// A non-zero exit code, or error records on the CLIXML error stream
    /// with a zero exit code, becomes [`Error::NotFound`] or
    /// [`Error::Execution`] carrying the decoded error stream. Warning and
    /// verbose records are left in [`CommandOutput::stderr`].
    pub async fn execute_command<T, I, S>(&self, fragments: I, opts: &PsCommandOptions) -> Result<CommandOutput<T>>
    where
        T: DeserializeOwned,
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let result = self.execute_raw(fragments, opts).await?;

        if result.exit_code != 0 {
            let message = decode_cli_xml(&result.stderr);
            debug!(exit_code = result.exit_code, message = %message, "Command reported failure");
            return Err(Error::from_remote(result.exit_code, message));
        }

        if let Some(message) = cli_xml_errors(&result.stderr) {
            debug!(message = %message, "Command wrote to the error stream");
            return Err(Error::from_remote(result.exit_code, message));
        }

        let records = decode_output(&result.stdout, opts.force_array)?;
        Ok(CommandOutput {
            records,
            stderr: result.stderr,
            exit_code: result.exit_code,
        })
    }

    async fn query_one<T: DeserializeOwned>(
        &self,
        cmdlet: Cmdlet,
        opts: &PsCommandOptions,
        kind: ErrorKind,
        identity: &str,
    ) -> Result<T> {
        self.execute_command::<T, _, _>(cmdlet.into_fragments(), opts)
            .await?
            .records
            .into_single()
            .ok_or_else(|| Error::NotFound {
                kind,
                message: format!("No object returned for identity '{}'", identity),
            })
    }

    /// Look up a user. `attributes` restricts the custom attributes kept on
    /// the record; an empty slice keeps everything returned.
    #[instrument(skip(self, attributes))]
    pub async fn get_user<S: AsRef<str>>(&self, identity: &str, attributes: &[S]) -> Result<User> {
        let cmdlet = Cmdlet::new("Get-ADUser")
            .param("Identity", identity)
            .raw("-Properties *");
        let opts = self.command_options().json();
        let mut user: User = self
            .query_one(cmdlet, &opts, ErrorKind::IdentityNotFound, identity)
            .await?;

        if !attributes.is_empty() {
            user.extra.retain(|key, _| {
                attributes
                    .iter()
                    .any(|a| a.as_ref().eq_ignore_ascii_case(key))
            });
        }
        Ok(user)
    }

    #[instrument(skip(self))]
    pub async fn get_group(&self, identity: &str) -> Result<Group> {
        let cmdlet = Cmdlet::new("Get-ADGroup")
            .param("Identity", identity)
            .list("Properties", &["Description"]);
        let opts = self.command_options().json();
        self.query_one(cmdlet, &opts, ErrorKind::IdentityNotFound, identity)
            .await
    }

    /// Members of a group, sorted by GUID.
    #[instrument(skip(self))]
    pub async fn get_group_membership(&self, identity: &str) -> Result<GroupMembership> {
        let cmdlet = Cmdlet::new("Get-ADGroupMember").param("Identity", identity);
        let opts = self.command_options().json().force_array();
        let output = self
            .execute_command::<GroupMember, _, _>(cmdlet.into_fragments(), &opts)
            .await?;
        Ok(GroupMembership::new(identity, output.records.into_vec()))
    }

    #[instrument(skip(self))]
    pub async fn get_computer(&self, identity: &str) -> Result<Computer> {
        let cmdlet = Cmdlet::new("Get-ADComputer")
            .param("Identity", identity)
            .list("Properties", &["Description"]);
        let opts = self.command_options().json();
        self.query_one(cmdlet, &opts, ErrorKind::ObjectNotFound, identity)
            .await
    }

    #[instrument(skip(self))]
    pub async fn get_ou(&self, identity: &str) -> Result<OrgUnit> {
        let cmdlet = Cmdlet::new("Get-ADOrganizationalUnit")
            .param("Identity", identity)
            .list("Properties", &["Description", "ProtectedFromAccidentalDeletion"]);
        let opts = self.command_options().json();
        self.query_one(cmdlet, &opts, ErrorKind::ObjectNotFound, identity)
            .await
    }

    /// Options for the group-policy cmdlets, which take no `-Credential`.
    fn gpo_options(&self) -> PsCommandOptions {
        let opts = self.command_options().json();
        if opts.pass_credentials {
            opts.invoke_command()
        } else {
            opts
        }
    }

    /// Look up a GPO by GUID, or by display name when no GUID is given.
    #[instrument(skip(self))]
    pub async fn get_gpo(&self, name: Option<&str>, guid: Option<&str>) -> Result<Gpo> {
        let (cmdlet, identity) = match (guid.filter(|g| !g.is_empty()), name.filter(|n| !n.is_empty())) {
            (Some(guid), _) => (Cmdlet::new("Get-GPO").param("Guid", guid), guid),
            (None, Some(name)) => (Cmdlet::new("Get-GPO").param("Name", name), name),
            (None, None) => {
                return Err(Error::Config(
                    "A GPO name or GUID is required".to_string(),
                ))
            }
        };
        self.query_one(cmdlet, &self.gpo_options(), ErrorKind::GpoNotFound, identity)
            .await
    }

    /// Every GPO link on `target_dn`, in link order.
    #[instrument(skip(self))]
    pub async fn get_gplinks(&self, target_dn: &str) -> Result<Vec<GpLink>> {
        let cmdlet = Cmdlet::new("Get-GPInheritance")
            .param("Target", target_dn)
            .pipe(Cmdlet::new("Select-Object").param("ExpandProperty", "GpoLinks"));
        let opts = self.gpo_options().force_array();
        let mut links = self
            .execute_command::<GpLink, _, _>(cmdlet.into_fragments(), &opts)
            .await?
            .records
            .into_vec();
        links.sort_by_key(|l| l.order);
        Ok(links)
    }

    /// The link from `gpo_guid` to `target_dn`.
    pub async fn get_gplink(&self, gpo_guid: &str, target_dn: &str) -> Result<GpLink> {
        self.get_gplinks(target_dn)
            .await?
            .into_iter()
            .find(|link| link.is_for(gpo_guid))
            .ok_or_else(|| Error::NotFound {
                kind: ErrorKind::LinkNotFound,
                message: format!(
                    "Get-GPInheritance did not find a link for GPO {} on {}",
                    gpo_guid, target_dn
                ),
            })
    }

    /// Close pooled sessions. Later calls fail with a pool-closed error.
    pub async fn shutdown(&self) {
        self.pool.close_all().await;
    }
}
