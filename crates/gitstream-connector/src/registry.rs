//! The stream registry: one typed descriptor per stream, parent/child
//! relations as explicit id lists.

use serde_json::Value;

use gitstream_core::stream::{ReplicationMethod, SourceOrder, StreamDescriptor};
use gitstream_core::Selection;

/// All streams the connector knows how to replicate.
pub struct Registry {
    streams: Vec<StreamDescriptor>,
}

impl Registry {
    pub fn new() -> Self {
        use ReplicationMethod::Incremental;
        use SourceOrder::{Ascending, Descending};

        let streams = vec![
            // Ref producers run first; the walker depends on their caches.
            StreamDescriptor {
                key_fields: &["repo_name"],
                sort_hint: 0,
                ..StreamDescriptor::new("branches", "branches?per_page=100")
            },
            StreamDescriptor {
                replication: Incremental,
                replication_key: Some("updated_at"),
                source_order: Descending,
                children: &["reviews", "review_comments"],
                sort_hint: 1,
                ..StreamDescriptor::new(
                    "pull_requests",
                    "pulls?per_page=100&state=all&sort=updated&direction=desc",
                )
            },
            StreamDescriptor {
                replication: Incremental,
                replication_key: Some("submitted_at"),
                parent: Some("pull_requests"),
                ..StreamDescriptor::new("reviews", "pulls/{number}/reviews?per_page=100")
            },
            StreamDescriptor {
                replication: Incremental,
                replication_key: Some("updated_at"),
                parent: Some("pull_requests"),
                ..StreamDescriptor::new("review_comments", "pulls/{number}/comments?per_page=100")
            },
            // Walker-driven streams; their paths are informational, the
            // walker builds its own listing URLs.
            StreamDescriptor {
                replication: Incremental,
                key_fields: &["sha"],
                sort_hint: 3,
                ..StreamDescriptor::new("commits", "commits?per_page=100")
            },
            StreamDescriptor {
                replication: Incremental,
                sort_hint: 4,
                ..StreamDescriptor::new("commit_files", "commits?per_page=100")
            },
            StreamDescriptor {
                replication: Incremental,
                replication_key: Some("updated_at"),
                source_order: Ascending,
                filter_param: true,
                ..StreamDescriptor::new(
                    "issues",
                    "issues?per_page=100&state=all&sort=updated&direction=asc",
                )
            },
            StreamDescriptor {
                replication: Incremental,
                replication_key: Some("updated_at"),
                source_order: Ascending,
                filter_param: true,
                ..StreamDescriptor::new(
                    "comments",
                    "issues/comments?per_page=100&sort=updated&direction=asc",
                )
            },
            StreamDescriptor {
                replication: Incremental,
                replication_key: Some("created_at"),
                source_order: Descending,
                ..StreamDescriptor::new(
                    "issue_events",
                    "issues/events?per_page=100&sort=created_at&direction=desc",
                )
            },
            StreamDescriptor {
                replication: Incremental,
                replication_key: Some("updated_at"),
                source_order: Descending,
                ..StreamDescriptor::new(
                    "issue_milestones",
                    "milestones?per_page=100&direction=desc",
                )
            },
            StreamDescriptor {
                replication: Incremental,
                replication_key: Some("updated_at"),
                source_order: Descending,
                ..StreamDescriptor::new(
                    "commit_comments",
                    "comments?per_page=100&sort=created_at&direction=desc",
                )
            },
            StreamDescriptor::new("issue_labels", "labels?per_page=100"),
            StreamDescriptor::new("releases", "releases?per_page=100"),
            StreamDescriptor::new("assignees", "assignees?per_page=100"),
            StreamDescriptor {
                key_fields: &["user_id"],
                accept: Some("application/vnd.github.v3.star+json"),
                ..StreamDescriptor::new("stargazers", "stargazers?per_page=100")
            },
            StreamDescriptor {
                discretionary: true,
                ..StreamDescriptor::new("collaborators", "collaborators?per_page=100")
            },
            StreamDescriptor {
                org_scoped: true,
                discretionary: true,
                children: &["team_members"],
                ..StreamDescriptor::new("teams", "orgs/{org}/teams?per_page=100")
            },
            StreamDescriptor {
                key_fields: &["team_slug", "id"],
                org_scoped: true,
                parent: Some("teams"),
                children: &["team_memberships"],
                ..StreamDescriptor::new(
                    "team_members",
                    "orgs/{org}/teams/{slug}/members?per_page=100",
                )
            },
            StreamDescriptor {
                key_fields: &["url"],
                org_scoped: true,
                parent: Some("team_members"),
                ..StreamDescriptor::new(
                    "team_memberships",
                    "orgs/{org}/teams/{team_slug}/memberships/{login}",
                )
            },
        ];

        Self { streams }
    }

    /// Looks up one descriptor by id.
    pub fn get(&self, id: &str) -> Option<&StreamDescriptor> {
        self.streams.iter().find(|s| s.id == id)
    }

    /// Every known stream id, for state migration and catalog validation.
    pub fn known_ids(&self) -> Vec<&'static str> {
        self.streams.iter().map(|s| s.id).collect()
    }

    /// Parent-less streams in scheduling order: ref producers first, then
    /// the rest by id.
    pub fn parentless_in_order(&self) -> Vec<&StreamDescriptor> {
        let mut streams: Vec<&StreamDescriptor> =
            self.streams.iter().filter(|s| s.parent.is_none()).collect();
        streams.sort_by_key(|s| (s.sort_hint, s.id));
        streams
    }

    /// Whether a stream must run: it is selected, or some descendant is.
    pub fn is_needed(&self, id: &str, selection: &Selection) -> bool {
        if selection.is_selected(id) {
            return true;
        }
        self.get(id)
            .map(|desc| desc.children.iter().any(|child| self.is_needed(child, selection)))
            .unwrap_or(false)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Computed fields some streams add before emission.
pub fn decorate(stream: &str, parent: Option<&Value>, record: &mut Value) {
    let Some(obj) = record.as_object_mut() else {
        return;
    };
    match stream {
        "stargazers" => {
            if let Some(user_id) = obj.get("user").and_then(|u| u.get("id")).cloned() {
                obj.insert("user_id".to_string(), user_id);
            }
        },
        "team_members" => {
            if let Some(slug) = parent.and_then(|p| p.get("slug")).cloned() {
                obj.insert("team_slug".to_string(), slug);
            }
        },
        _ => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ref_producers_sort_first() {
        let registry = Registry::new();
        let order: Vec<&str> = registry.parentless_in_order().iter().map(|s| s.id).collect();
        assert_eq!(order[0], "branches");
        assert_eq!(order[1], "pull_requests");
        let commits_at = order.iter().position(|id| *id == "commits").unwrap();
        let files_at = order.iter().position(|id| *id == "commit_files").unwrap();
        assert!(commits_at < files_at);
        assert!(order.iter().position(|id| *id == "issues").unwrap() > files_at);
    }

    #[test]
    fn test_children_are_not_parentless() {
        let registry = Registry::new();
        let order: Vec<&str> = registry.parentless_in_order().iter().map(|s| s.id).collect();
        assert!(!order.contains(&"reviews"));
        assert!(!order.contains(&"team_memberships"));
    }

    #[test]
    fn test_is_needed_walks_descendants() {
        let registry = Registry::new();
        let selection = Selection::all(&["review_comments"]);
        assert!(registry.is_needed("pull_requests", &selection));
        assert!(!registry.is_needed("commits", &selection));

        let nested = Selection::all(&["team_memberships"]);
        assert!(registry.is_needed("teams", &nested));
        assert!(registry.is_needed("team_members", &nested));
    }

    #[test]
    fn test_decorate_stargazers_and_team_members() {
        let mut record = json!({"user": {"id": 77}});
        decorate("stargazers", None, &mut record);
        assert_eq!(record["user_id"], 77);

        let parent = json!({"slug": "platform"});
        let mut member = json!({"id": 5, "login": "ada"});
        decorate("team_members", Some(&parent), &mut member);
        assert_eq!(member["team_slug"], "platform");
    }
}
