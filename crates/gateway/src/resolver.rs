//! Protocol resolver (C4): a pure decision table from account + config to a
//! transport. Never performs I/O.

use relay_config::OpenAiWsConfig;
use relay_protocol::{Account, IngressMode, Transport, TransportDecision};

fn decision(transport: Transport, reason: impl Into<String>) -> TransportDecision {
    TransportDecision {
        transport,
        reason: reason.into(),
    }
}

/// Resolves which transport a turn for `account` should take, given the
/// global `openai_ws` config. First matching rule wins.
#[must_use]
pub fn resolve_transport(account: Option<&Account>, config: &OpenAiWsConfig) -> TransportDecision {
    let Some(account) = account else {
        return decision(Transport::HttpSse, "no account resolved");
    };

    if !account.platform.is_openai_family() {
        return decision(Transport::HttpSse, "account is not in the OpenAI family");
    }
    if account.force_http() {
        return decision(Transport::HttpSse, "account force_http override");
    }
    if config.force_http {
        return decision(Transport::HttpSse, "global force_http");
    }
    if !config.enabled {
        return decision(Transport::HttpSse, "openai_ws globally disabled");
    }

    match account.auth_type {
        relay_protocol::AuthType::OAuth if !config.oauth_enabled => {
            return decision(Transport::HttpSse, "oauth auth disabled");
        },
        relay_protocol::AuthType::ApiKey if !config.apikey_enabled => {
            return decision(Transport::HttpSse, "api-key auth disabled");
        },
        _ => {},
    }

    if config.mode_router_v2_enabled {
        let mode = account.ws_v2_mode_override().unwrap_or(config.ingress_mode_default);
        match mode {
            IngressMode::Off => return decision(Transport::HttpSse, "account ingress mode is off"),
            IngressMode::Shared | IngressMode::Dedicated => {
                if account.concurrency == 0 {
                    return decision(Transport::HttpSse, "account has zero concurrency");
                }
                if config.responses_websockets_v2 {
                    return decision(Transport::WsV2, format!("ws-v2 enabled, mode={mode:?}"));
                }
            },
        }
    }

    if config.responses_websockets {
        return decision(Transport::WsV1, "ws-v1 enabled");
    }

    decision(Transport::HttpSse, "no websocket transport enabled")
}

/// Policy gate (C8 point 1): rejects a turn outright instead of silently
/// falling back to HTTP-SSE, for the one case where serving the turn at all
/// would contradict an explicit account-level policy rather than just a
/// transport preference — the account's ingress mode is switched off while
/// the mode router is globally enabled.
#[must_use]
pub fn policy_gate(account: &Account, config: &OpenAiWsConfig) -> Option<String> {
    if !config.mode_router_v2_enabled {
        return None;
    }
    let mode = account.ws_v2_mode_override().unwrap_or(config.ingress_mode_default);
    if mode == IngressMode::Off {
        return Some("websocket mode is disabled for this account".to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use relay_protocol::{AuthType, Credential, Platform, AccountStatus};
    use secrecy::Secret;

    use super::*;

    fn account(platform: Platform, auth_type: AuthType, concurrency: u32) -> Account {
        Account {
            id: "acct-1".into(),
            name: "test".into(),
            platform,
            auth_type,
            priority: 0,
            concurrency,
            schedulable: true,
            status: AccountStatus::Active,
            credential: Credential::ApiKey {
                key: Secret::new("sk-test".into()),
            },
            extra: serde_json::Map::new(),
            models: Vec::new(),
        }
    }

    #[test]
    fn missing_account_is_http_sse() {
        let config = OpenAiWsConfig::default();
        let result = resolve_transport(None, &config);
        assert_eq!(result.transport, Transport::HttpSse);
    }

    #[test]
    fn non_openai_family_is_http_sse() {
        let config = OpenAiWsConfig::default();
        let acct = account(Platform::Anthropic, AuthType::ApiKey, 4);
        assert_eq!(resolve_transport(Some(&acct), &config).transport, Transport::HttpSse);
    }

    #[test]
    fn globally_disabled_is_http_sse() {
        let mut config = OpenAiWsConfig::default();
        config.enabled = false;
        let acct = account(Platform::OpenAi, AuthType::ApiKey, 4);
        assert_eq!(resolve_transport(Some(&acct), &config).transport, Transport::HttpSse);
    }

    #[test]
    fn disabled_auth_type_is_http_sse() {
        let mut config = OpenAiWsConfig::default();
        config.oauth_enabled = false;
        let acct = account(Platform::OpenAi, AuthType::OAuth, 4);
        assert_eq!(resolve_transport(Some(&acct), &config).transport, Transport::HttpSse);
    }

    #[test]
    fn mode_router_v2_off_mode_is_http_sse() {
        let mut config = OpenAiWsConfig::default();
        config.mode_router_v2_enabled = true;
        config.ingress_mode_default = IngressMode::Off;
        let acct = account(Platform::OpenAi, AuthType::ApiKey, 4);
        assert_eq!(resolve_transport(Some(&acct), &config).transport, Transport::HttpSse);
    }

    #[test]
    fn mode_router_v2_zero_concurrency_is_http_sse() {
        let mut config = OpenAiWsConfig::default();
        config.mode_router_v2_enabled = true;
        config.ingress_mode_default = IngressMode::Shared;
        config.responses_websockets_v2 = true;
        let acct = account(Platform::OpenAi, AuthType::ApiKey, 0);
        assert_eq!(resolve_transport(Some(&acct), &config).transport, Transport::HttpSse);
    }

    #[test]
    fn ws_v2_enabled_and_shared_mode_selects_ws_v2() {
        let mut config = OpenAiWsConfig::default();
        config.mode_router_v2_enabled = true;
        config.ingress_mode_default = IngressMode::Shared;
        config.responses_websockets_v2 = true;
        let acct = account(Platform::OpenAi, AuthType::ApiKey, 4);
        assert_eq!(resolve_transport(Some(&acct), &config).transport, Transport::WsV2);
    }

    #[test]
    fn falls_back_to_ws_v1_when_v2_not_selected() {
        let config = OpenAiWsConfig::default();
        let acct = account(Platform::OpenAi, AuthType::ApiKey, 4);
        assert_eq!(resolve_transport(Some(&acct), &config).transport, Transport::WsV1);
    }

    #[test]
    fn falls_back_to_http_sse_when_no_transport_enabled() {
        let mut config = OpenAiWsConfig::default();
        config.responses_websockets = false;
        let acct = account(Platform::OpenAi, AuthType::ApiKey, 4);
        assert_eq!(resolve_transport(Some(&acct), &config).transport, Transport::HttpSse);
    }

    #[test]
    fn account_force_http_override_wins_even_if_ws_enabled() {
        let config = OpenAiWsConfig::default();
        let mut acct = account(Platform::OpenAi, AuthType::ApiKey, 4);
        acct.extra.insert("force_http".into(), serde_json::Value::Bool(true));
        assert_eq!(resolve_transport(Some(&acct), &config).transport, Transport::HttpSse);
    }

    #[test]
    fn policy_gate_passes_when_mode_router_disabled() {
        let config = OpenAiWsConfig::default();
        let acct = account(Platform::OpenAi, AuthType::ApiKey, 4);
        assert_eq!(policy_gate(&acct, &config), None);
    }

    #[test]
    fn policy_gate_rejects_an_off_mode_account() {
        let mut config = OpenAiWsConfig::default();
        config.mode_router_v2_enabled = true;
        config.ingress_mode_default = IngressMode::Off;
        let acct = account(Platform::OpenAi, AuthType::ApiKey, 4);
        assert_eq!(
            policy_gate(&acct, &config),
            Some("websocket mode is disabled for this account".to_string())
        );
    }

    #[test]
    fn policy_gate_passes_a_shared_mode_account() {
        let mut config = OpenAiWsConfig::default();
        config.mode_router_v2_enabled = true;
        config.ingress_mode_default = IngressMode::Shared;
        let acct = account(Platform::OpenAi, AuthType::ApiKey, 4);
        assert_eq!(policy_gate(&acct, &config), None);
    }
}
