use rusqlite::Connection;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pipelines (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE,
  team TEXT NOT NULL,
  config_json TEXT NOT NULL,
  config_version INTEGER NOT NULL,
  paused INTEGER NOT NULL DEFAULT 0,
  archived INTEGER NOT NULL DEFAULT 0,
  updated_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS resources (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  pipeline_id INTEGER NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
  name TEXT NOT NULL,
  type TEXT NOT NULL,
  source_json TEXT NOT NULL,
  check_every_ms INTEGER,
  last_checked_at_ms INTEGER,
  check_error TEXT,
  UNIQUE(pipeline_id, name)
);

CREATE TABLE IF NOT EXISTS resource_versions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  resource_id INTEGER NOT NULL REFERENCES resources(id) ON DELETE CASCADE,
  version_json TEXT NOT NULL,
  digest TEXT NOT NULL,
  metadata_json TEXT NOT NULL,
  enabled INTEGER NOT NULL DEFAULT 1,
  discovered_at_ms INTEGER NOT NULL,
  UNIQUE(resource_id, digest)
);

CREATE TABLE IF NOT EXISTS jobs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  pipeline_id INTEGER NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
  name TEXT NOT NULL,
  serial INTEGER NOT NULL DEFAULT 0,
  active INTEGER NOT NULL DEFAULT 1,
  build_number_seq INTEGER NOT NULL DEFAULT 0,
  UNIQUE(pipeline_id, name)
);

CREATE TABLE IF NOT EXISTS builds (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  pipeline_id INTEGER REFERENCES pipelines(id) ON DELETE CASCADE,
  job_id INTEGER REFERENCES jobs(id) ON DELETE CASCADE,
  team TEXT,
  status TEXT NOT NULL,
  engine TEXT,
  engine_metadata TEXT,
  manually_triggered INTEGER NOT NULL DEFAULT 0,
  created_at_ms INTEGER NOT NULL,
  started_at_ms INTEGER,
  completed_at_ms INTEGER,
  error TEXT
);

CREATE INDEX IF NOT EXISTS builds_status_idx ON builds(status);
CREATE INDEX IF NOT EXISTS builds_job_idx ON builds(job_id, status);

CREATE TABLE IF NOT EXISTS build_inputs (
  build_id INTEGER NOT NULL REFERENCES builds(id) ON DELETE CASCADE,
  name TEXT NOT NULL,
  version_id INTEGER NOT NULL REFERENCES resource_versions(id) ON DELETE CASCADE,
  is_trigger INTEGER NOT NULL DEFAULT 0,
  PRIMARY KEY(build_id, name)
);

CREATE TABLE IF NOT EXISTS build_outputs (
  build_id INTEGER NOT NULL REFERENCES builds(id) ON DELETE CASCADE,
  version_id INTEGER NOT NULL REFERENCES resource_versions(id) ON DELETE CASCADE,
  PRIMARY KEY(build_id, version_id)
);

CREATE TABLE IF NOT EXISTS job_triggers (
  job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
  input_name TEXT NOT NULL,
  version_id INTEGER NOT NULL REFERENCES resource_versions(id) ON DELETE CASCADE,
  build_id INTEGER NOT NULL REFERENCES builds(id) ON DELETE CASCADE,
  PRIMARY KEY(job_id, input_name, version_id)
);

CREATE TABLE IF NOT EXISTS locks (
  name TEXT PRIMARY KEY,
  holder TEXT NOT NULL,
  instance TEXT NOT NULL,
  acquired_at_ms INTEGER NOT NULL,
  expires_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS workers (
  name TEXT PRIMARY KEY,
  addr TEXT NOT NULL,
  team TEXT,
  resource_types_json TEXT NOT NULL,
  platform TEXT NOT NULL,
  tags_json TEXT NOT NULL,
  active_containers INTEGER NOT NULL DEFAULT 0,
  expires_at_ms INTEGER,
  last_used_at_ms INTEGER,
  registered_at_ms INTEGER NOT NULL
);
"#;

pub(super) fn install(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}
