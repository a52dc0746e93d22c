//! Account resolution — map inbound sender addresses to platform users.

use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use tracing::info;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::Database;
use crate::tasks::model::{MembershipScope, Project, User};

/// Finds or creates users for email senders.
pub struct AccountResolver {
    db: Arc<dyn Database>,
}

impl AccountResolver {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Resolve a sender to a user.
    ///
    /// Unknown senders get an account with a random credential and viewer
    /// membership at every scope the project carries (organization,
    /// workspace, project). A real password is set later through account
    /// recovery, outside this subsystem.
    pub async fn resolve(
        &self,
        project: &Project,
        email: &str,
        display_name: Option<&str>,
    ) -> Result<User, DatabaseError> {
        let email = email.to_lowercase();
        if let Some(user) = self.db.find_user_by_email(&email).await? {
            return Ok(user);
        }

        let name = display_name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(String::from)
            .unwrap_or_else(|| local_part(&email));

        let user = User {
            id: Uuid::new_v4().to_string(),
            email: email.clone(),
            name,
            credential: random_credential(),
            created_at: Utc::now(),
        };

        match self.db.insert_user(&user).await {
            Ok(()) => {}
            // Another sync created the same sender first.
            Err(e) if e.is_unique_violation() => {
                if let Some(existing) = self.db.find_user_by_email(&email).await? {
                    return Ok(existing);
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        }

        if let Some(org_id) = &project.organization_id {
            self.db
                .ensure_membership(&user.id, MembershipScope::Organization, org_id, "viewer")
                .await?;
        }
        if let Some(workspace_id) = &project.workspace_id {
            self.db
                .ensure_membership(&user.id, MembershipScope::Workspace, workspace_id, "viewer")
                .await?;
        }
        self.db
            .ensure_membership(&user.id, MembershipScope::Project, &project.id, "viewer")
            .await?;

        info!(email = %user.email, user_id = %user.id, "Created user for email sender");
        Ok(user)
    }
}

fn local_part(email: &str) -> String {
    email.split('@').next().unwrap_or(email).to_string()
}

fn random_credential() -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}
