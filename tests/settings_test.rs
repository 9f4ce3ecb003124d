use std::fs;

use serial_test::serial;
use tempfile::TempDir;

use pinauth::settings::SECRETS_DIR_ENV;
use pinauth::testing::fixtures::TEST_SIGNING_KEY_PEM;
use pinauth::{AuthServiceFactory, AuthSettings, Collaborators};

const ENV_VARS: &[&str] = &[
    SECRETS_DIR_ENV,
    "STATE_SECRET",
    "TOKEN_ISSUER",
    "TOKEN_PRIVATE_KEY_PATH",
    "SESSION_TTL_HOURS",
    "MAGIC_LINK_BASE_URL",
    "ACME_CLIENT_SECRET",
];

fn clean_env() {
    for var in ENV_VARS {
        std::env::remove_var(var);
    }
}

fn write_settings(dir: &TempDir, key_path: &str) {
    let toml = format!(
        r#"
[token]
issuer = "https://pins.example.com"
audience = "pins-api"
private_key_path = "{key_path}"
default_ttl_minutes = 15

[state]
secret = "file-secret"

[password]
bcrypt_cost = 10

[magic_link]
max_attempts = 5

[[providers]]
name = "google"
client_id = "google-client"
client_secret = "google-secret"
redirect_url = "https://pins.example.com/oauth2/callback"

[[providers]]
name = "acme"
enabled = false
"#
    );
    fs::write(dir.path().join("Settings.toml"), toml).unwrap();
}

fn write_key(dir: &TempDir) -> String {
    let key_path = dir.path().join("signing.pem");
    fs::write(&key_path, TEST_SIGNING_KEY_PEM).unwrap();
    key_path.to_string_lossy().replace('\\', "/")
}

#[test]
#[serial]
fn test_secrets_dir_settings_and_env_precedence() {
    clean_env();
    let dir = TempDir::new().unwrap();
    let key_path = write_key(&dir);
    write_settings(&dir, &key_path);

    std::env::set_var(SECRETS_DIR_ENV, dir.path());
    std::env::set_var("TOKEN_ISSUER", "https://override.example.com");
    std::env::set_var("SESSION_TTL_HOURS", "12");

    let settings = AuthSettings::load_settings().unwrap();
    clean_env();

    assert_eq!(settings.token.issuer, "https://override.example.com");
    assert_eq!(settings.token.audience.as_deref(), Some("pins-api"));
    assert_eq!(settings.token.default_ttl_minutes, 15);
    assert_eq!(settings.state.secret, "file-secret");
    assert_eq!(settings.session.authenticated_ttl_hours, 12);
    assert_eq!(settings.magic_link.max_attempts, 5);
    // Untouched sections keep their defaults
    assert_eq!(settings.magic_link.ttl_minutes, 15);
    assert_eq!(settings.get_enabled_providers().len(), 1);
    assert_eq!(
        settings.token.load_private_key_pem().unwrap().trim(),
        TEST_SIGNING_KEY_PEM.trim()
    );
}

#[test]
#[serial]
fn test_invalid_settings_file_is_an_error() {
    clean_env();
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("Settings.toml"), "[token\nissuer = ").unwrap();

    std::env::set_var(SECRETS_DIR_ENV, dir.path());
    let result = AuthSettings::load_settings();
    clean_env();

    let err = result.unwrap_err();
    assert!(format!("{err:#}").contains("Failed to parse settings file"));
}

#[tokio::test]
#[serial]
async fn test_loaded_settings_build_services() {
    clean_env();
    let dir = TempDir::new().unwrap();
    let key_path = write_key(&dir);
    write_settings(&dir, &key_path);
    std::env::set_var(SECRETS_DIR_ENV, dir.path());

    let settings = AuthSettings::load_settings().unwrap();
    clean_env();

    let services = AuthServiceFactory::build(
        &settings,
        Collaborators::in_memory(std::sync::Arc::new(
            pinauth::testing::mock::RecordingMailer::new(),
        )),
    )
    .await
    .unwrap();

    assert_eq!(
        services.registry.names().await,
        vec!["anonymous", "google", "magic_link", "password"]
    );
    assert_eq!(services.tokens.config().issuer, "https://pins.example.com");
}
