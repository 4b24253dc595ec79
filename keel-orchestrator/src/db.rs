use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

const CATALOG_TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS applications (
        id BIGSERIAL PRIMARY KEY,
        name VARCHAR(255) NOT NULL,
        project_id BIGINT NOT NULL DEFAULT 0,
        display_name VARCHAR(255)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS app_labels (
        id BIGSERIAL PRIMARY KEY,
        app_id BIGINT NOT NULL REFERENCES applications(id) ON DELETE CASCADE,
        key VARCHAR(255) NOT NULL,
        value TEXT NOT NULL,
        propagate BOOLEAN NOT NULL DEFAULT FALSE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS environments (
        id BIGSERIAL PRIMARY KEY,
        name VARCHAR(255) NOT NULL,
        cluster_id BIGINT NOT NULL,
        cluster_name VARCHAR(255) NOT NULL,
        namespace VARCHAR(255) NOT NULL,
        is_prod BOOLEAN NOT NULL DEFAULT FALSE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pipelines (
        id BIGSERIAL PRIMARY KEY,
        app_id BIGINT NOT NULL REFERENCES applications(id),
        env_id BIGINT NOT NULL REFERENCES environments(id),
        name VARCHAR(255) NOT NULL,
        deployment_app_name VARCHAR(255) NOT NULL,
        default_strategy VARCHAR(50) NOT NULL DEFAULT 'ROLLING',
        deploy_target VARCHAR(50) NOT NULL DEFAULT 'GITOPS',
        registry_id VARCHAR(255),
        use_digest BOOLEAN NOT NULL DEFAULT FALSE,
        deleted BOOLEAN NOT NULL DEFAULT FALSE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pipeline_strategies (
        id BIGSERIAL PRIMARY KEY,
        pipeline_id BIGINT NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
        strategy VARCHAR(50) NOT NULL,
        config JSONB NOT NULL DEFAULT '{}',
        is_default BOOLEAN NOT NULL DEFAULT FALSE,
        UNIQUE (pipeline_id, strategy)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS db_migration_configs (
        pipeline_id BIGINT PRIMARY KEY REFERENCES pipelines(id) ON DELETE CASCADE,
        git_repo_url TEXT NOT NULL,
        git_user VARCHAR(255) NOT NULL DEFAULT '',
        git_auth_token TEXT NOT NULL DEFAULT '',
        script_location TEXT NOT NULL DEFAULT '',
        db_type VARCHAR(50) NOT NULL,
        db_user_name VARCHAR(255) NOT NULL,
        db_password TEXT NOT NULL,
        db_host VARCHAR(255) NOT NULL,
        db_port VARCHAR(10) NOT NULL,
        db_name VARCHAR(255) NOT NULL,
        active BOOLEAN NOT NULL DEFAULT TRUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS registry_pull_secrets (
        id BIGSERIAL PRIMARY KEY,
        registry_id VARCHAR(255) NOT NULL,
        cluster_id BIGINT,
        secret_name VARCHAR(255) NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS artifacts (
        id BIGSERIAL PRIMARY KEY,
        image TEXT NOT NULL,
        image_digest TEXT,
        material_info JSONB NOT NULL DEFAULT '{}',
        registry_id VARCHAR(255),
        created_on TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id BIGSERIAL PRIMARY KEY,
        email VARCHAR(255) NOT NULL,
        active BOOLEAN NOT NULL DEFAULT TRUE
    )
    "#,
];

const CONFIG_TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS chart_refs (
        id BIGSERIAL PRIMARY KEY,
        name VARCHAR(255) NOT NULL,
        version VARCHAR(50) NOT NULL,
        image_descriptor_template TEXT NOT NULL,
        app_metrics_supported BOOLEAN NOT NULL DEFAULT FALSE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS app_charts (
        id BIGSERIAL PRIMARY KEY,
        app_id BIGINT NOT NULL REFERENCES applications(id),
        chart_ref_id BIGINT NOT NULL REFERENCES chart_refs(id),
        default_values JSONB NOT NULL DEFAULT '{}',
        chart_location TEXT NOT NULL,
        git_repo_url TEXT,
        latest BOOLEAN NOT NULL DEFAULT FALSE,
        created_on TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS env_overrides (
        id BIGSERIAL PRIMARY KEY,
        app_id BIGINT NOT NULL,
        env_id BIGINT NOT NULL,
        chart_id BIGINT NOT NULL REFERENCES app_charts(id),
        env_values JSONB NOT NULL DEFAULT '{}',
        namespace VARCHAR(255) NOT NULL,
        is_override BOOLEAN NOT NULL DEFAULT FALSE,
        latest BOOLEAN NOT NULL DEFAULT FALSE,
        status VARCHAR(20) NOT NULL DEFAULT 'NEW',
        active BOOLEAN NOT NULL DEFAULT TRUE,
        created_by BIGINT NOT NULL,
        created_on TIMESTAMPTZ NOT NULL,
        UNIQUE (app_id, env_id, chart_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS config_payloads (
        id BIGSERIAL PRIMARY KEY,
        app_id BIGINT NOT NULL,
        env_id BIGINT,
        config_maps JSONB NOT NULL DEFAULT '[]',
        secrets JSONB NOT NULL DEFAULT '[]'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scoped_variables (
        id BIGSERIAL PRIMARY KEY,
        name VARCHAR(255) NOT NULL,
        value JSONB NOT NULL,
        sensitive BOOLEAN NOT NULL DEFAULT FALSE,
        app_id BIGINT,
        env_id BIGINT,
        cluster_id BIGINT
    )
    "#,
];

const EXECUTION_TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS cd_workflows (
        id BIGSERIAL PRIMARY KEY,
        pipeline_id BIGINT NOT NULL REFERENCES pipelines(id),
        artifact_id BIGINT NOT NULL REFERENCES artifacts(id),
        created_on TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS release_overrides (
        id BIGSERIAL PRIMARY KEY,
        pipeline_id BIGINT NOT NULL REFERENCES pipelines(id),
        env_override_id BIGINT NOT NULL REFERENCES env_overrides(id),
        artifact_id BIGINT NOT NULL REFERENCES artifacts(id),
        workflow_id BIGINT NOT NULL REFERENCES cd_workflows(id),
        counter BIGINT NOT NULL,
        status VARCHAR(20) NOT NULL,
        deployment_type VARCHAR(20) NOT NULL,
        strategy VARCHAR(50) NOT NULL,
        commit_hash TEXT,
        commit_time TIMESTAMPTZ,
        merged_values JSONB,
        created_by BIGINT NOT NULL,
        created_on TIMESTAMPTZ NOT NULL,
        updated_by BIGINT NOT NULL,
        updated_on TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cd_workflow_runners (
        id BIGSERIAL PRIMARY KEY,
        workflow_id BIGINT NOT NULL REFERENCES cd_workflows(id) ON DELETE CASCADE,
        release_override_id BIGINT REFERENCES release_overrides(id),
        stage VARCHAR(20) NOT NULL,
        status VARCHAR(20) NOT NULL,
        deploy_target VARCHAR(50) NOT NULL,
        started_on TIMESTAMPTZ NOT NULL,
        finished_on TIMESTAMPTZ,
        triggered_by BIGINT NOT NULL,
        message TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS timeline_entries (
        id BIGSERIAL PRIMARY KEY,
        runner_id BIGINT NOT NULL REFERENCES cd_workflow_runners(id) ON DELETE CASCADE,
        status VARCHAR(50) NOT NULL,
        detail TEXT NOT NULL DEFAULT '',
        status_time TIMESTAMPTZ NOT NULL,
        created_on TIMESTAMPTZ NOT NULL,
        UNIQUE (runner_id, status)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS app_status (
        app_id BIGINT NOT NULL,
        env_id BIGINT NOT NULL,
        release_id BIGINT NOT NULL,
        status VARCHAR(50) NOT NULL,
        settled BOOLEAN NOT NULL DEFAULT FALSE,
        updated_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (app_id, env_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS deployment_histories (
        id BIGSERIAL PRIMARY KEY,
        pipeline_id BIGINT NOT NULL REFERENCES pipelines(id),
        runner_id BIGINT NOT NULL REFERENCES cd_workflow_runners(id),
        chart_ref_id BIGINT NOT NULL,
        template JSONB NOT NULL,
        strategy VARCHAR(50) NOT NULL,
        strategy_config JSONB,
        config_maps JSONB NOT NULL DEFAULT '[]',
        secrets JSONB NOT NULL DEFAULT '[]',
        variable_snapshot JSONB NOT NULL DEFAULT '{}',
        deployed_on TIMESTAMPTZ NOT NULL,
        deployed_by BIGINT NOT NULL
    )
    "#,
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_pipelines_app_env ON pipelines(app_id, env_id)",
    "CREATE INDEX IF NOT EXISTS idx_pipelines_deployment_app_name ON pipelines(deployment_app_name)",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_env_overrides_latest ON env_overrides(app_id, env_id) WHERE latest",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_config_payloads_scope ON config_payloads(app_id, COALESCE(env_id, 0))",
    "CREATE INDEX IF NOT EXISTS idx_scoped_variables_name ON scoped_variables(name)",
    "CREATE INDEX IF NOT EXISTS idx_release_overrides_pipeline_counter ON release_overrides(pipeline_id, counter)",
    "CREATE INDEX IF NOT EXISTS idx_release_overrides_commit ON release_overrides(pipeline_id, commit_hash)",
    "CREATE INDEX IF NOT EXISTS idx_runners_workflow_stage ON cd_workflow_runners(workflow_id, stage)",
    "CREATE INDEX IF NOT EXISTS idx_runners_status ON cd_workflow_runners(status)",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_timeline_terminal ON timeline_entries(runner_id) \
     WHERE status IN ('APP_HEALTHY', 'FAILED', 'FETCH_TIMED_OUT', 'GIT_COMMIT_FAILED', 'DEPLOYMENT_SUPERSEDED')",
    "CREATE INDEX IF NOT EXISTS idx_histories_pipeline_runner ON deployment_histories(pipeline_id, runner_id)",
];

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in CATALOG_TABLES
        .iter()
        .chain(CONFIG_TABLES)
        .chain(EXECUTION_TABLES)
        .chain(INDEXES)
    {
        sqlx::query(statement).execute(pool).await?;
    }

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
