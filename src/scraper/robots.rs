//! robots.txt rules for one origin, as seen by our configured agent.

use std::time::Duration;
use texting_robots::Robot;
use tracing::warn;

/// Parsed rules, or none at all when the file was missing or unreadable.
pub struct RobotsTxt {
    robot: Option<Robot>,
}

impl RobotsTxt {
    pub fn allow_all() -> Self {
        Self { robot: None }
    }

    /// A file that fails to parse is treated as absent.
    pub fn parse(agent: &str, content: &str) -> Self {
        match Robot::new(agent, content.as_bytes()) {
            Ok(robot) => Self { robot: Some(robot) },
            Err(e) => {
                warn!("Unparseable robots.txt ({}), allowing", e);
                Self::allow_all()
            }
        }
    }

    pub fn is_allowed(&self, url: &str) -> bool {
        self.robot.as_ref().is_none_or(|r| r.allowed(url))
    }

    pub fn crawl_delay(&self) -> Option<Duration> {
        let secs = self.robot.as_ref()?.delay?;
        (secs.is_finite() && secs > 0.0).then(|| Duration::from_secs_f32(secs))
    }
}
