use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use pinauth::settings::{AuthSettings, ProviderSettings};
use pinauth::testing::constants::TEST_CLIENT_ID;
use pinauth::testing::fixtures::{rs256_jwk, rs256_sign, TestFixtures, TEST_SIGNING_KEY_PEM};
use pinauth::store::{InMemoryUserDirectory, UserDirectory};
use pinauth::testing::mock::RecordingMailer;
use pinauth::{
    AuthErrorCode, AuthServiceFactory, AuthServices, Collaborators, Credential, NewUser,
    RequestIdentity,
};

const SUBJECT: &str = "248289761001";

fn idp_settings(server: &MockServer) -> ProviderSettings {
    ProviderSettings {
        authorization_endpoint: Some(format!("{}/authorize", server.uri())),
        token_endpoint: Some(format!("{}/token", server.uri())),
        userinfo_endpoint: Some(format!("{}/userinfo", server.uri())),
        jwks_uri: Some(format!("{}/jwks", server.uri())),
        issuer: Some(server.uri()),
        display_name: Some("Acme ID".to_string()),
        ..TestFixtures::oauth_settings("acme")
    }
}

fn id_token(server: &MockServer) -> String {
    let now = Utc::now().timestamp();
    rs256_sign(
        TEST_SIGNING_KEY_PEM,
        Some("idp-key"),
        &json!({
            "iss": server.uri(),
            "aud": TEST_CLIENT_ID,
            "sub": SUBJECT,
            "email": "jane@example.com",
            "email_verified": true,
            "name": "Jane Doe",
            "iat": now,
            "exp": now + 600,
        }),
    )
}

async fn mount_jwks(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/jwks"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "keys": [rs256_jwk(TEST_SIGNING_KEY_PEM, "idp-key")] })),
        )
        .mount(server)
        .await;
}

async fn build(settings: AuthSettings) -> (AuthServices, Arc<RecordingMailer>) {
    let mailer = Arc::new(RecordingMailer::new());
    let services = AuthServiceFactory::build(&settings, Collaborators::in_memory(mailer.clone()))
        .await
        .expect("services build");
    (services, mailer)
}

fn settings_with(provider: ProviderSettings) -> AuthSettings {
    AuthSettings {
        providers: vec![provider],
        ..TestFixtures::settings()
    }
}

#[tokio::test]
async fn test_anonymous_principal_upgraded_through_oauth() {
    let server = MockServer::start().await;
    mount_jwks(&server).await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("code=auth-code-123"))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "access-123",
            "id_token": id_token(&server),
            "token_type": "Bearer",
            "expires_in": 3600,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let users = Arc::new(InMemoryUserDirectory::new());
    let collaborators = Collaborators {
        users: users.clone(),
        ..Collaborators::in_memory(Arc::new(RecordingMailer::new()))
    };
    let services = AuthServiceFactory::build(&settings_with(idp_settings(&server)), collaborators)
        .await
        .unwrap();

    // Anonymous first visit
    let anonymous = services
        .authenticate(
            "anonymous",
            &Credential::Anonymous {
                username: "river42".to_string(),
            },
        )
        .await
        .unwrap();
    let signed = services.sign_in(&anonymous).await.unwrap();
    let session_id = signed.session.id.clone();
    let owner = services
        .tokens
        .verify_token(&signed.token)
        .unwrap()
        .user_id()
        .map(str::to_string);
    assert_eq!(owner.as_deref(), Some(anonymous.id.as_str()));

    // Redirect round trip carries the session id inside the sealed state
    let redirect = services
        .begin_oauth("acme", "/home", Some(&session_id))
        .unwrap();
    assert!(redirect
        .authorization_url
        .starts_with(&format!("{}/authorize?", server.uri())));

    let (identity, state) = services
        .complete_oauth("acme", &redirect.state_token, "auth-code-123")
        .await
        .unwrap();
    assert_eq!(identity.id, SUBJECT);
    assert_eq!(identity.provider, "acme");
    assert_eq!(identity.email.as_deref(), Some("jane@example.com"));
    assert!(identity.email_verified);
    assert_eq!(identity.metadata["id_token_verified"], json!(true));
    assert_eq!(state.redirect_url, "/home");
    assert_eq!(state.session_id.as_deref(), Some(session_id.as_str()));

    let upgraded = services
        .upgrade_session(&session_id, &identity)
        .await
        .unwrap();
    assert_eq!(upgraded.session.id, session_id);
    assert!(upgraded.session.is_authenticated());

    let request = RequestIdentity::from_bearer_header(
        &services.tokens,
        Some(&format!("Bearer {}", upgraded.token)),
    )
    .unwrap();
    assert!(!request.is_anonymous());
    // Everything written while anonymous stays attributed to the same id
    assert_eq!(request.user_id().map(str::to_string), owner);
    assert_eq!(request.session_id(), Some(session_id.as_str()));
    let claims = request.claims().unwrap();
    assert_eq!(claims.identity.metadata["provider_subject"], json!(SUBJECT));
    assert_eq!(claims.identity.email.as_deref(), Some("jane@example.com"));

    // The backing record was flipped in place
    let record = users.get_user_by_id(&anonymous.id).await.unwrap().unwrap();
    assert!(!record.is_anonymous);
    assert_eq!(record.username, "river42");
    assert_eq!(record.email, "jane@example.com");
    assert!(record.email_verified);
}

#[tokio::test]
async fn test_upgrade_links_anonymous_principal_to_existing_account() {
    let (services, _) = build(TestFixtures::settings()).await;
    let password = services.password().unwrap();
    let registered = password
        .register(&NewUser::new("a@b.com", "Correct-Horse-9"))
        .await
        .unwrap();

    let anonymous = services
        .authenticate(
            "anonymous",
            &Credential::Anonymous {
                username: "river42".to_string(),
            },
        )
        .await
        .unwrap();
    let signed = services.sign_in(&anonymous).await.unwrap();

    let returning = services
        .authenticate(
            "password",
            &Credential::Password {
                email: "a@b.com".to_string(),
                password: "Correct-Horse-9".to_string(),
            },
        )
        .await
        .unwrap();
    let upgraded = services
        .upgrade_session(&signed.session.id, &returning)
        .await
        .unwrap();

    assert_eq!(upgraded.session.user_id.as_deref(), Some(registered.id.as_str()));
    assert_eq!(
        upgraded.session.principal_id.as_deref(),
        Some(anonymous.id.as_str())
    );
    let claims = services.tokens.verify_token(&upgraded.token).unwrap();
    assert_eq!(claims.user_id(), Some(registered.id.as_str()));
}

#[tokio::test]
async fn test_userinfo_fallback_without_id_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "access-456",
            "token_type": "Bearer",
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/userinfo"))
        .and(header("authorization", "Bearer access-456"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sub": "gh-991",
            "email": "dev@example.com",
            "given_name": "Dev",
            "family_name": "Eloper",
            "picture": "https://cdn.example.com/a.png",
        })))
        .mount(&server)
        .await;

    let (services, _) = build(settings_with(idp_settings(&server))).await;
    let identity = services
        .authenticate(
            "acme",
            &Credential::AuthorizationCode {
                code: "code-2".to_string(),
            },
        )
        .await
        .unwrap();

    assert_eq!(identity.id, "gh-991");
    assert_eq!(identity.display_name.as_deref(), Some("Dev Eloper"));
    assert_eq!(identity.avatar_url.as_deref(), Some("https://cdn.example.com/a.png"));
    assert!(!identity.email_verified);
}

#[tokio::test]
async fn test_rejected_code_and_bad_state() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_string(r#"{"error":"invalid_grant"}"#))
        .mount(&server)
        .await;

    let (services, _) = build(settings_with(idp_settings(&server))).await;
    let redirect = services.begin_oauth("acme", "/", None).unwrap();

    let err = services
        .complete_oauth("acme", &redirect.state_token, "stale-code")
        .await
        .unwrap_err();
    assert_eq!(err.code, AuthErrorCode::ProviderError);
    assert!(err.message.contains("invalid_grant"));

    // Forged state never reaches the token endpoint
    let mut forged = redirect.state_token.clone().into_bytes();
    forged[20] = if forged[20] == b'A' { b'B' } else { b'A' };
    let err = services
        .complete_oauth("acme", &String::from_utf8(forged).unwrap(), "code")
        .await
        .unwrap_err();
    assert_eq!(err.code, AuthErrorCode::TokenInvalid);

    let err = services
        .complete_oauth("google", &redirect.state_token, "code")
        .await
        .unwrap_err();
    assert_eq!(err.code, AuthErrorCode::TokenInvalid);
}

#[tokio::test]
async fn test_direct_id_token_login() {
    let server = MockServer::start().await;
    mount_jwks(&server).await;

    let (services, _) = build(settings_with(idp_settings(&server))).await;
    let identity = services
        .authenticate(
            "acme",
            &Credential::IdToken {
                id_token: id_token(&server),
            },
        )
        .await
        .unwrap();
    assert_eq!(identity.id, SUBJECT);
    assert_eq!(identity.display_name.as_deref(), Some("Jane Doe"));
}

#[tokio::test]
async fn test_password_flow_through_registry() {
    let (services, _) = build(TestFixtures::settings()).await;
    let password = services.password().unwrap();

    let registered = password
        .register(&NewUser::new("a@b.com", "Correct-Horse-9"))
        .await
        .unwrap();
    let err = password
        .register(&NewUser::new("A@B.com", "Correct-Horse-9"))
        .await
        .unwrap_err();
    assert_eq!(err.code, AuthErrorCode::EmailTaken);

    let identity = services
        .authenticate(
            "password",
            &Credential::Password {
                email: "a@b.com".to_string(),
                password: "Correct-Horse-9".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(identity.id, registered.id);
    assert_eq!(identity.provider, "password");

    let signed = services.sign_in(&identity).await.unwrap();
    let claims = services.tokens.verify_token(&signed.token).unwrap();
    assert_eq!(claims.user_id(), Some(registered.id.as_str()));
    assert!(claims.exp.is_some());

    // Unknown email and wrong password are indistinguishable
    for (email, pw) in [("a@b.com", "wrong"), ("nobody@b.com", "Correct-Horse-9")] {
        let err = services
            .authenticate(
                "password",
                &Credential::Password {
                    email: email.to_string(),
                    password: pw.to_string(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, AuthErrorCode::InvalidCredentials);
    }
}

#[tokio::test]
async fn test_magic_link_redeemed_once() {
    let (services, mailer) = build(TestFixtures::settings()).await;

    let err = services
        .authenticate(
            "magic_link",
            &Credential::MagicLinkSend {
                email: "reader@example.com".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, AuthErrorCode::MagicLinkSent);

    let token = mailer.last().await.unwrap().token;
    let redeem = Credential::MagicLinkVerify { token };

    let identity = services.authenticate("magic_link", &redeem).await.unwrap();
    assert_eq!(identity.email.as_deref(), Some("reader@example.com"));
    assert!(identity.email_verified);

    let err = services.authenticate("magic_link", &redeem).await.unwrap_err();
    assert_eq!(err.code, AuthErrorCode::TokenInvalid);
}

#[tokio::test]
async fn test_unknown_provider() {
    let (services, _) = build(TestFixtures::settings()).await;
    let err = services
        .authenticate(
            "github",
            &Credential::AuthorizationCode {
                code: "c".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, AuthErrorCode::ProviderNotFound);
    assert!(services.begin_oauth("github", "/", None).is_err());
}
