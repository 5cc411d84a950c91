//! Schema as const SQL, applied once at `Store::connect`, following
//! `link_index::open`'s schema-as-const-SQL convention (translated from
//! SQLite DDL to Postgres: `gen_random_uuid()`, `TIMESTAMPTZ`, native
//! arrays for `include_paths`/`exclude_paths`).

pub const SCHEMA_SQL: &str = r#"
CREATE EXTENSION IF NOT EXISTS pgcrypto;

CREATE TABLE IF NOT EXISTS domains (
    id                          UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    name                        TEXT NOT NULL UNIQUE,
    adaptive_delay_seconds      DOUBLE PRECISION NOT NULL DEFAULT 0.5,
    adaptive_delay_floor_seconds DOUBLE PRECISION NOT NULL DEFAULT 0.0
);

CREATE TABLE IF NOT EXISTS pages (
    id          UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    domain_id   UUID NOT NULL REFERENCES domains(id),
    path        TEXT NOT NULL,
    UNIQUE (domain_id, path)
);

CREATE TABLE IF NOT EXISTS jobs (
    id                  UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    domain_id           UUID NOT NULL REFERENCES domains(id),
    user_id             UUID,
    organisation_id     UUID,
    status              TEXT NOT NULL,
    progress            DOUBLE PRECISION NOT NULL DEFAULT 0,
    total_tasks         BIGINT NOT NULL DEFAULT 0,
    completed_tasks     BIGINT NOT NULL DEFAULT 0,
    failed_tasks        BIGINT NOT NULL DEFAULT 0,
    skipped_tasks       BIGINT NOT NULL DEFAULT 0,
    found_tasks         BIGINT NOT NULL DEFAULT 0,
    sitemap_tasks       BIGINT NOT NULL DEFAULT 0,
    concurrency         INT NOT NULL DEFAULT 1,
    find_links          BOOLEAN NOT NULL DEFAULT FALSE,
    max_pages           INT,
    include_paths       TEXT[] NOT NULL DEFAULT '{}',
    exclude_paths       TEXT[] NOT NULL DEFAULT '{}',
    required_workers    INT,
    created_at          TIMESTAMPTZ NOT NULL DEFAULT now(),
    started_at          TIMESTAMPTZ,
    completed_at        TIMESTAMPTZ,
    error_message       TEXT,
    source_type         TEXT,
    source_url          TEXT
);

CREATE INDEX IF NOT EXISTS jobs_domain_org_status_idx ON jobs (domain_id, organisation_id, status);

CREATE TABLE IF NOT EXISTS tasks (
    id                  UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    job_id              UUID NOT NULL REFERENCES jobs(id),
    page_id             UUID NOT NULL REFERENCES pages(id),
    path                TEXT NOT NULL,
    status              TEXT NOT NULL,
    retry_count         INT NOT NULL DEFAULT 0,
    priority_score      DOUBLE PRECISION NOT NULL DEFAULT 0.5,
    created_at          TIMESTAMPTZ NOT NULL DEFAULT now(),
    started_at          TIMESTAMPTZ,
    completed_at        TIMESTAMPTZ,
    source_type         TEXT NOT NULL,
    source_url          TEXT,
    status_code         INT,
    response_time_ms    BIGINT,
    cache_status        TEXT,
    content_type        TEXT,
    error               TEXT,
    UNIQUE (job_id, page_id)
);

CREATE INDEX IF NOT EXISTS tasks_job_status_priority_idx ON tasks (job_id, status, priority_score DESC, created_at ASC);
CREATE INDEX IF NOT EXISTS tasks_status_started_idx ON tasks (status, started_at);

CREATE TABLE IF NOT EXISTS crawl_results (
    id                  UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    task_id             UUID NOT NULL REFERENCES tasks(id),
    status_code         INT,
    response_time_ms    BIGINT,
    cache_status        TEXT,
    content_type        TEXT,
    error               TEXT,
    recorded_at         TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#;
