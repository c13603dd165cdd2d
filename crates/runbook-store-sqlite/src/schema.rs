/// Relational schema for runs, playbooks, categories and conditions.
pub(crate) const SCHEMA_VERSION: i64 = 1;

/// Marker recorded once legacy key/value data has been moved into the
/// relational tables.
pub const KV_MIGRATION_VERSION: i64 = 2;

pub(crate) const SCHEMA_MIGRATIONS: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

// channel_members, team_members and bots mirror the host chat platform;
// visibility predicates join against them.
pub(crate) const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS channel_members (
  channel_id TEXT NOT NULL,
  user_id TEXT NOT NULL,
  PRIMARY KEY (channel_id, user_id)
);

CREATE TABLE IF NOT EXISTS team_members (
  team_id TEXT NOT NULL,
  user_id TEXT NOT NULL,
  delete_at INTEGER NOT NULL DEFAULT 0,
  PRIMARY KEY (team_id, user_id)
);

CREATE TABLE IF NOT EXISTS bots (
  user_id TEXT PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS playbooks (
  id TEXT PRIMARY KEY,
  title TEXT NOT NULL,
  description TEXT NOT NULL DEFAULT '',
  team_id TEXT NOT NULL,
  create_public_run INTEGER NOT NULL DEFAULT 0 CHECK (create_public_run IN (0, 1)),
  create_at INTEGER NOT NULL,
  delete_at INTEGER NOT NULL DEFAULT 0,
  num_stages INTEGER NOT NULL DEFAULT 0,
  num_steps INTEGER NOT NULL DEFAULT 0,
  checklists_json TEXT NOT NULL DEFAULT '[]',
  broadcast_channel_id TEXT NOT NULL DEFAULT '',
  broadcast_enabled INTEGER NOT NULL DEFAULT 0 CHECK (broadcast_enabled IN (0, 1)),
  webhook_on_creation_url TEXT NOT NULL DEFAULT '',
  webhook_on_status_update_url TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_playbooks_team ON playbooks(team_id, delete_at);

CREATE TABLE IF NOT EXISTS playbook_members (
  playbook_id TEXT NOT NULL REFERENCES playbooks(id),
  member_id TEXT NOT NULL,
  PRIMARY KEY (playbook_id, member_id)
);

CREATE TABLE IF NOT EXISTS runs (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  summary TEXT NOT NULL DEFAULT '',
  owner_user_id TEXT NOT NULL DEFAULT '',
  reporter_user_id TEXT NOT NULL DEFAULT '',
  team_id TEXT NOT NULL,
  channel_id TEXT NOT NULL UNIQUE,
  create_at INTEGER NOT NULL,
  end_at INTEGER NOT NULL DEFAULT 0,
  delete_at INTEGER NOT NULL DEFAULT 0,
  current_status TEXT NOT NULL CHECK (
    current_status IN ('Reported', 'InProgress', 'Finished', 'Archived')
  ),
  last_status_update_at INTEGER NOT NULL DEFAULT 0,
  playbook_id TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_runs_team ON runs(team_id);
CREATE INDEX IF NOT EXISTS idx_runs_playbook ON runs(playbook_id);

CREATE TABLE IF NOT EXISTS run_checklists (
  id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL REFERENCES runs(id),
  title TEXT NOT NULL,
  position INTEGER NOT NULL CHECK (position >= 0),
  UNIQUE (run_id, position)
);

CREATE TABLE IF NOT EXISTS run_checklist_items (
  id TEXT PRIMARY KEY,
  checklist_id TEXT NOT NULL REFERENCES run_checklists(id),
  run_id TEXT NOT NULL REFERENCES runs(id),
  position INTEGER NOT NULL CHECK (position >= 0),
  title TEXT NOT NULL,
  state TEXT NOT NULL DEFAULT '' CHECK (state IN ('', 'in_progress', 'closed', 'skipped')),
  state_modified INTEGER NOT NULL DEFAULT 0,
  assignee_id TEXT NOT NULL DEFAULT '',
  assignee_modified INTEGER NOT NULL DEFAULT 0,
  command TEXT NOT NULL DEFAULT '',
  command_last_run INTEGER NOT NULL DEFAULT 0,
  description TEXT NOT NULL DEFAULT '',
  due_date INTEGER NOT NULL DEFAULT 0,
  UNIQUE (checklist_id, position)
);

CREATE INDEX IF NOT EXISTS idx_run_checklist_items_run ON run_checklist_items(run_id);

CREATE TABLE IF NOT EXISTS status_posts (
  run_id TEXT NOT NULL REFERENCES runs(id),
  post_id TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('Reported', 'InProgress', 'Finished', 'Archived')),
  create_at INTEGER NOT NULL,
  delete_at INTEGER NOT NULL DEFAULT 0,
  PRIMARY KEY (run_id, post_id)
);

CREATE TABLE IF NOT EXISTS timeline_events (
  id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL REFERENCES runs(id),
  create_at INTEGER NOT NULL,
  delete_at INTEGER NOT NULL DEFAULT 0,
  event_at INTEGER NOT NULL,
  event_type TEXT NOT NULL,
  summary TEXT NOT NULL DEFAULT '',
  details TEXT NOT NULL DEFAULT '',
  post_id TEXT NOT NULL DEFAULT '',
  subject_user_id TEXT NOT NULL DEFAULT '',
  creator_user_id TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_timeline_events_run ON timeline_events(run_id, event_at);

CREATE TABLE IF NOT EXISTS run_participants (
  run_id TEXT NOT NULL REFERENCES runs(id),
  user_id TEXT NOT NULL,
  is_follower INTEGER NOT NULL DEFAULT 0 CHECK (is_follower IN (0, 1)),
  PRIMARY KEY (run_id, user_id)
);

CREATE TABLE IF NOT EXISTS viewed_channels (
  channel_id TEXT NOT NULL,
  user_id TEXT NOT NULL,
  PRIMARY KEY (channel_id, user_id)
);

CREATE TABLE IF NOT EXISTS categories (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  team_id TEXT NOT NULL,
  user_id TEXT NOT NULL,
  collapsed INTEGER NOT NULL DEFAULT 0 CHECK (collapsed IN (0, 1)),
  create_at INTEGER NOT NULL,
  update_at INTEGER NOT NULL,
  delete_at INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_categories_team_user ON categories(team_id, user_id);

CREATE TABLE IF NOT EXISTS category_items (
  category_id TEXT NOT NULL REFERENCES categories(id),
  item_id TEXT NOT NULL,
  item_type TEXT NOT NULL CHECK (item_type IN ('playbook', 'run')),
  PRIMARY KEY (category_id, item_id, item_type)
);

CREATE TABLE IF NOT EXISTS conditions (
  id TEXT PRIMARY KEY,
  playbook_id TEXT NOT NULL,
  run_id TEXT NOT NULL DEFAULT '',
  version INTEGER NOT NULL CHECK (version >= 1),
  expr_json TEXT NOT NULL,
  property_field_ids TEXT NOT NULL DEFAULT '[]',
  property_option_ids TEXT NOT NULL DEFAULT '[]',
  create_at INTEGER NOT NULL,
  update_at INTEGER NOT NULL,
  delete_at INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_conditions_playbook ON conditions(playbook_id, create_at);

CREATE TABLE IF NOT EXISTS plugin_kv (
  pkey TEXT PRIMARY KEY,
  pvalue BLOB NOT NULL
);
";
