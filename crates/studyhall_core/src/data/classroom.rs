//! Classroom handle.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::cancel::CancelScope;
use super::live::LiveDriver;
use crate::error::{Result, StudyError};
use crate::model::{
    AssignedContent, CLASSROOM_CONFIG_DOC, COURSE_CONFIG_DOC, ClassroomConfig, classroom_namespace,
    course_namespace,
};

/// The capacity in which a classroom is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassroomRole {
    /// Enrolled learner; reads configuration and assignments.
    Student,
    /// Teacher; may also change assignments.
    Teacher,
}

/// Access to one classroom of the live backend.
#[derive(Clone)]
pub struct ClassroomHandle {
    driver: Arc<LiveDriver>,
    classroom_id: String,
    namespace: String,
    role: ClassroomRole,
    scope: CancelScope,
}

impl ClassroomHandle {
    /// Open a classroom, checking that the session holds `role` in it.
    pub(crate) async fn open(
        driver: Arc<LiveDriver>,
        classroom_id: &str,
        role: ClassroomRole,
        scope: CancelScope,
    ) -> Result<Self> {
        let handle = Self {
            namespace: classroom_namespace(classroom_id),
            classroom_id: classroom_id.to_string(),
            driver,
            role,
            scope,
        };
        let username = handle.driver.require_session("open a classroom")?;
        let config = handle.get_config().await?;
        let allowed = handle.driver.session_is_admin()
            || match role {
                ClassroomRole::Teacher => config.is_teacher(&username),
                ClassroomRole::Student => config.is_member(&username),
            };
        if !allowed {
            return Err(StudyError::PermissionDenied(format!(
                "'{}' is not a {:?} of classroom '{}'",
                username, role, classroom_id
            )));
        }
        Ok(handle)
    }

    /// Bind this handle to a caller-owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.scope = self.scope.with_caller(token);
        self
    }

    /// Id of the open classroom.
    pub fn classroom_id(&self) -> &str {
        &self.classroom_id
    }

    /// Capacity the classroom was opened in.
    pub fn role(&self) -> ClassroomRole {
        self.role
    }

    /// Current classroom configuration.
    pub async fn get_config(&self) -> Result<ClassroomConfig> {
        self.scope
            .race(async {
                Ok(self
                    .driver
                    .fetch::<ClassroomConfig>(&self.namespace, CLASSROOM_CONFIG_DOC)
                    .await?
                    .value)
            })
            .await
    }

    /// Material assigned to the classroom.
    pub async fn assigned_content(&self) -> Result<Vec<AssignedContent>> {
        Ok(self.get_config().await?.assigned_content)
    }

    fn require_teacher(&self, operation: &str) -> Result<()> {
        self.scope.ensure_open()?;
        if self.role != ClassroomRole::Teacher {
            return Err(StudyError::PermissionDenied(format!(
                "students may not {}",
                operation
            )));
        }
        Ok(())
    }

    /// Assign a course or a tag of a course. Assigning twice is a no-op.
    pub async fn assign_content(&self, content: AssignedContent) -> Result<()> {
        self.require_teacher("assign content")?;
        let course_id = match &content {
            AssignedContent::Course { course_id } | AssignedContent::Tag { course_id, .. } => course_id,
        };
        let course_exists = self
            .scope
            .race(async {
                match self
                    .driver
                    .get::<serde_json::Value>(&course_namespace(course_id), COURSE_CONFIG_DOC)
                    .await
                {
                    Ok(found) => Ok(found.is_some()),
                    Err(StudyError::NotFound(_)) => Ok(false),
                    Err(e) => Err(e),
                }
            })
            .await?;
        if !course_exists {
            return Err(StudyError::NotFound(format!("course '{}'", course_id)));
        }

        self.scope.check()?;
        self.driver
            .modify::<ClassroomConfig, _>(&self.namespace, CLASSROOM_CONFIG_DOC, |current| {
                let mut config = current
                    .ok_or_else(|| StudyError::NotFound(format!("classroom '{}'", self.classroom_id)))?;
                if config.assigned_content.contains(&content) {
                    return Ok(None);
                }
                config.assigned_content.push(content.clone());
                Ok(Some(config))
            })
            .await?;
        Ok(())
    }

    /// Remove an assignment. Unknown assignments are ignored.
    pub async fn unassign_content(&self, content: &AssignedContent) -> Result<()> {
        self.require_teacher("unassign content")?;
        self.scope.check()?;
        self.driver
            .modify::<ClassroomConfig, _>(&self.namespace, CLASSROOM_CONFIG_DOC, |current| {
                let mut config = current
                    .ok_or_else(|| StudyError::NotFound(format!("classroom '{}'", self.classroom_id)))?;
                let before = config.assigned_content.len();
                config.assigned_content.retain(|c| c != content);
                Ok((config.assigned_content.len() != before).then_some(config))
            })
            .await?;
        Ok(())
    }
}
