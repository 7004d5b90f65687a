use serde::{Deserialize, Serialize};

use crate::project::EntityStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    pub host: String,
    pub user: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub identity_file: Option<String>,
    #[serde(default)]
    pub status: EntityStatus,
}

fn default_port() -> u16 {
    22
}

impl Server {
    pub fn is_valid(&self) -> bool {
        !self.host.is_empty() && !self.user.is_empty()
    }

    /// `user@host`, the form used in record text and ssh targets.
    pub fn address(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.host
        } else {
            &self.name
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_is_22() {
        let server: Server =
            serde_json::from_str(r#"{"id": 1, "host": "web-1.internal", "user": "deploy"}"#)
                .unwrap();
        assert_eq!(server.port, 22);
        assert_eq!(server.address(), "deploy@web-1.internal");
        assert_eq!(server.label(), "web-1.internal");
        assert!(server.is_valid());
    }
}
