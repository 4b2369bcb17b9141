//! The provisioning sequence.
//!
//! Six idempotent steps bring a fresh (or partially provisioned) server to
//! the same end state: both users exist, each owns an index without mirror
//! bases, and the client session points at the primary index. The session
//! the external client keeps is mirrored in an explicit [`ActiveContext`]
//! that every step updates.
//!
//! A failing step stops the sequence. Nothing is rolled back; the report
//! records how far the run got.

use std::fmt::Display;

use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::{
    client::{ClientError, IndexClient, IndexPath, IndexState},
    config::Target,
};

/// Client-side session state as left by the steps run so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveContext {
    pub url: Option<Url>,
    /// User the client is logged in as.
    pub login: Option<String>,
    pub index: Option<IndexPath>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    UseServer,
    EnsurePrimaryUser,
    LoginPrimary,
    EnsurePrimaryIndex,
    EnsureSecondaryUser,
    EnsureSecondaryIndex,
}

impl Step {
    pub const ALL: [Step; 6] = [
        Step::UseServer,
        Step::EnsurePrimaryUser,
        Step::LoginPrimary,
        Step::EnsurePrimaryIndex,
        Step::EnsureSecondaryUser,
        Step::EnsureSecondaryIndex,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Step::UseServer => "use-server",
            Step::EnsurePrimaryUser => "ensure-primary-user",
            Step::LoginPrimary => "login-primary",
            Step::EnsurePrimaryIndex => "ensure-primary-index",
            Step::EnsureSecondaryUser => "ensure-secondary-user",
            Step::EnsureSecondaryIndex => "ensure-secondary-index",
        }
    }
}

impl Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("provisioning step {step} failed")]
pub struct ProvisionError {
    pub step: Step,
    #[source]
    pub source: ClientError,
}

/// Outcome of one pass through the sequence.
#[derive(Debug)]
pub struct ProvisionReport {
    pub completed: Vec<Step>,
    pub context: ActiveContext,
    pub failure: Option<ProvisionError>,
}

impl ProvisionReport {
    pub fn is_complete(&self) -> bool {
        self.failure.is_none() && self.completed.len() == Step::ALL.len()
    }
}

/// Run every step in order, stopping at the first failure.
pub async fn provision<C>(
    client: &C,
    url: &Url,
    primary: &Target,
    secondary: &Target,
) -> ProvisionReport
where
    C: IndexClient + ?Sized,
{
    let mut sequencer = Sequencer {
        client,
        url,
        primary,
        secondary,
        context: ActiveContext::default(),
    };
    let mut completed = Vec::with_capacity(Step::ALL.len());

    for step in Step::ALL {
        if let Err(source) = sequencer.run(step).await {
            match &source {
                ClientError::UnexpectedStatus { url, status } => error!(
                    %step,
                    %url,
                    status,
                    "Unexpected error while checking index; stopping"
                ),
                other => error!(
                    %step,
                    error = %other,
                    "Provisioning step failed; stopping"
                ),
            }
            return ProvisionReport {
                completed,
                context: sequencer.context,
                failure: Some(ProvisionError { step, source }),
            };
        }
        completed.push(step);
    }

    info!(
        index = %primary.index_path(),
        "Provisioning complete"
    );
    ProvisionReport {
        completed,
        context: sequencer.context,
        failure: None,
    }
}

struct Sequencer<'a, C: ?Sized> {
    client: &'a C,
    url: &'a Url,
    primary: &'a Target,
    secondary: &'a Target,
    context: ActiveContext,
}

impl<C> Sequencer<'_, C>
where
    C: IndexClient + ?Sized,
{
    async fn run(&mut self, step: Step) -> Result<(), ClientError> {
        let (primary, secondary) = (self.primary, self.secondary);
        match step {
            Step::UseServer => {
                info!(url = %self.url, "Connecting to devpi server...");
                self.client.use_server(self.url).await?;
                self.context = ActiveContext {
                    url: Some(self.url.clone()),
                    ..ActiveContext::default()
                };
            }
            Step::EnsurePrimaryUser => self.ensure_user(primary).await?,
            Step::LoginPrimary => self.login(primary).await?,
            Step::EnsurePrimaryIndex => {
                let index = primary.index_path();
                self.ensure_index(&index).await?;
                self.switch_to(&index).await?;
            }
            Step::EnsureSecondaryUser => {
                self.ensure_user(secondary).await?;
                self.login(secondary).await?;
            }
            Step::EnsureSecondaryIndex => {
                let index = secondary.index_path();
                self.ensure_index(&index).await?;
                self.switch_to(&index).await?;
                info!(index = %primary.index_path(), "Switching back");
                self.switch_to(&primary.index_path()).await?;
            }
        }
        Ok(())
    }

    async fn ensure_user(
        &mut self,
        target: &Target,
    ) -> Result<(), ClientError> {
        if self.client.user_exists(&target.user).await? {
            info!(
                user = %target.user,
                "User already exists, skipping creation"
            );
            return Ok(());
        }
        info!(user = %target.user, "Creating user");
        self.client
            .create_user(&target.user, &target.password)
            .await
    }

    async fn login(&mut self, target: &Target) -> Result<(), ClientError> {
        info!(user = %target.user, "Logging in");
        self.client.login(&target.user, &target.password).await?;
        self.context.login = Some(target.user.clone());
        Ok(())
    }

    async fn ensure_index(
        &mut self,
        index: &IndexPath,
    ) -> Result<(), ClientError> {
        match self.client.index_state(self.url, index).await? {
            IndexState::Present { bases } if bases.is_empty() => {
                info!(%index, "Index already exists, skipping creation");
            }
            IndexState::Present { bases } => {
                warn!(
                    %index,
                    bases = %bases.join(","),
                    "Index already exists with mirror bases; leaving it as is"
                );
            }
            IndexState::Absent => {
                info!(%index, "Creating index without mirror bases");
                self.client.create_index(index).await?;
            }
        }
        Ok(())
    }

    async fn switch_to(
        &mut self,
        index: &IndexPath,
    ) -> Result<(), ClientError> {
        info!(index = %index.use_target(), "Switching index");
        self.client.use_index(index).await?;
        self.context.index = Some(index.clone());
        Ok(())
    }
}
