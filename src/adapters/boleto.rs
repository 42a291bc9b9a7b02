//! Boleto-issuing bank. OAuth2 client credentials over mutual TLS; the
//! reference is the bank's `codigoSolicitacao`.

use {
    super::{
        convert::{parse_timestamp, received_amount, unparseable},
        http_client::{ProviderHttpClient, RequestAuth},
        registry::AdapterSettings,
        retry::RetryPolicy,
        token_cache::TokenCache,
    },
    crate::domain::{
        charge::ChargeStatus,
        credential::{CredentialSecret, GatewayCredential},
        error::ChargeError,
        id::{EventId, IdempotencyKey, ProviderReference},
        provider::{
            AccessToken, ChargeDetails, FetchedStatus, IssuedCharge, PaymentInstrument,
            ProviderAdapter, ProviderFuture, ProviderType, WebhookNotification,
        },
        status_map,
    },
    rust_decimal::Decimal,
    serde::{Deserialize, Serialize},
    std::time::Duration,
};

const SCOPES: &str = "boleto-cobranca.read boleto-cobranca.write";
/// `seuNumero` is limited to 15 characters.
const OUR_NUMBER_LEN: usize = 15;

pub struct BoletoAdapter {
    http: ProviderHttpClient,
    client_id: String,
    client_secret: String,
    tokens: TokenCache,
    retry: RetryPolicy,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IssueRequest<'a> {
    seu_numero: &'a str,
    valor_nominal: Decimal,
    data_vencimento: String,
    num_dias_agenda: u32,
    pagador: Pagador<'a>,
    mensagem: Mensagem<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Pagador<'a> {
    cpf_cnpj: String,
    tipo_pessoa: &'static str,
    nome: &'a str,
    email: &'a str,
}

#[derive(Serialize)]
struct Mensagem<'a> {
    linha1: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueResponse {
    codigo_solicitacao: String,
}

#[derive(Deserialize)]
struct DetailResponse {
    cobranca: Cobranca,
    #[serde(default)]
    boleto: Option<BoletoLines>,
    #[serde(default)]
    pix: Option<PixData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Cobranca {
    situacao: String,
    #[serde(default)]
    codigo_solicitacao: Option<String>,
    #[serde(default)]
    seu_numero: Option<String>,
    #[serde(default)]
    valor_total_recebido: Option<Decimal>,
    #[serde(default)]
    data_situacao: Option<String>,
}

/// One page of the charge listing. Each entry has the detail shape.
#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    cobrancas: Vec<DetailResponse>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BoletoLines {
    linha_digitavel: Option<String>,
    codigo_barras: Option<String>,
    nosso_numero: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PixData {
    pix_copia_e_cola: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallbackItem {
    codigo_solicitacao: String,
    situacao: String,
    #[serde(default)]
    data_hora_situacao: Option<String>,
    #[serde(default)]
    valor_total_recebido: Option<Decimal>,
}

impl BoletoAdapter {
    pub fn new(credential: &GatewayCredential, settings: &AdapterSettings) -> Result<Self, ChargeError> {
        let CredentialSecret::OAuthMtls {
            client_id,
            client_secret,
            certificate_pem,
            private_key_pem,
        } = &credential.secret
        else {
            return Err(ChargeError::Configuration(format!(
                "boleto credential {} must be oauth_mtls, got {}",
                credential.id,
                credential.secret.kind()
            )));
        };

        let identity = if certificate_pem.is_empty() {
            None
        } else {
            let pem = format!("{certificate_pem}\n{private_key_pem}");
            Some(reqwest::Identity::from_pem(pem.as_bytes()).map_err(|e| {
                ChargeError::Configuration(format!(
                    "boleto credential {} has an unusable certificate: {e}",
                    credential.id
                ))
            })?)
        };

        Ok(Self {
            http: ProviderHttpClient::new(
                ProviderType::Boleto,
                credential.base_url()?,
                settings.timeout,
                identity,
            )?,
            client_id: client_id.clone(),
            client_secret: client_secret.clone(),
            tokens: TokenCache::new(),
            retry: settings.retry,
        })
    }

    async fn request_token(&self) -> Result<(AccessToken, Duration), ChargeError> {
        let form = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("grant_type", "client_credentials"),
            ("scope", SCOPES),
        ];
        let anonymous = RequestAuth::None;
        let response: TokenResponse = self
            .retry
            .run("boleto token", || {
                self.http.post_form("/oauth/v2/token", &anonymous, &form)
            })
            .await?;
        Ok((
            AccessToken::new(response.access_token),
            Duration::from_secs(response.expires_in),
        ))
    }

    async fn bearer(&self) -> Result<RequestAuth, ChargeError> {
        let token = self.tokens.get_or_refresh(|| self.request_token()).await?;
        Ok(RequestAuth::Bearer(token.secret().to_string()))
    }

    async fn detail(&self, reference: &ProviderReference) -> Result<DetailResponse, ChargeError> {
        let auth = self.bearer().await?;
        let result = self
            .http
            .get_json(&format!("/cobranca/v3/cobrancas/{}", reference.as_str()), &auth)
            .await;
        if matches!(result, Err(ChargeError::Authentication(_))) {
            // Revoked before its expiry; the next call fetches a fresh one.
            self.tokens.invalidate().await;
        }
        result
    }
}

impl BoletoAdapter {
    /// Looks for a live charge the bank already holds under our `seuNumero`.
    /// The bank does not deduplicate on it, so a retried POST would create a
    /// second slip.
    async fn find_issued(
        &self,
        details: &ChargeDetails,
        our_number: &str,
    ) -> Result<Option<IssuedCharge>, ChargeError> {
        let auth = self.bearer().await?;
        let due = details.due_date.format("%Y-%m-%d").to_string();
        let query = [
            ("seuNumero", our_number),
            ("dataInicial", due.as_str()),
            ("dataFinal", due.as_str()),
            ("filtrarDataPor", "VENCIMENTO"),
        ];
        let page: ListResponse = self
            .http
            .get_json_query("/cobranca/v3/cobrancas", &auth, &query)
            .await?;

        let found = page.cobrancas.into_iter().find(|entry| {
            entry.cobranca.seu_numero.as_deref() == Some(our_number)
                && status_map::map_status(ProviderType::Boleto, &entry.cobranca.situacao)
                    != ChargeStatus::Canceled
        });
        let Some(entry) = found else {
            return Ok(None);
        };
        let Some(code) = entry.cobranca.codigo_solicitacao.clone() else {
            return Ok(None);
        };
        let reference = ProviderReference::new(code)?;
        Ok(Some(IssuedCharge {
            instrument: instrument(&reference, Some(&entry)),
            reference,
        }))
    }
}

fn instrument(reference: &ProviderReference, detail: Option<&DetailResponse>) -> PaymentInstrument {
    let lines = detail.and_then(|d| d.boleto.as_ref());
    let pix = detail.and_then(|d| d.pix.as_ref());
    PaymentInstrument::new(serde_json::json!({
        "codigo_solicitacao": reference.as_str(),
        "linha_digitavel": lines.and_then(|l| l.linha_digitavel.clone()),
        "codigo_barras": lines.and_then(|l| l.codigo_barras.clone()),
        "nosso_numero": lines.and_then(|l| l.nosso_numero.clone()),
        "pix_copia_e_cola": pix.and_then(|p| p.pix_copia_e_cola.clone()),
    }))
}

impl ProviderAdapter for BoletoAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Boleto
    }

    fn authenticate(&self) -> ProviderFuture<'_, AccessToken> {
        Box::pin(async move { self.tokens.get_or_refresh(|| self.request_token()).await })
    }

    fn issue_charge<'a>(
        &'a self,
        details: &'a ChargeDetails,
        key: &'a IdempotencyKey,
    ) -> ProviderFuture<'a, IssuedCharge> {
        Box::pin(async move {
            let our_number = key.truncated(OUR_NUMBER_LEN);
            if details.possibly_issued {
                if let Some(issued) = self.find_issued(details, our_number).await? {
                    tracing::info!(
                        charge_id = %details.charge_id,
                        reference = %issued.reference,
                        "boleto already issued under our number, reusing it"
                    );
                    return Ok(issued);
                }
            }

            let auth = self.bearer().await?;
            let body = IssueRequest {
                seu_numero: our_number,
                valor_nominal: details.amount.value(),
                data_vencimento: details.due_date.format("%Y-%m-%d").to_string(),
                num_dias_agenda: 30,
                pagador: Pagador {
                    cpf_cnpj: details.payer.document_digits(),
                    tipo_pessoa: if details.payer.is_company() { "JURIDICA" } else { "FISICA" },
                    nome: &details.payer.name,
                    email: &details.payer.email,
                },
                mensagem: Mensagem {
                    linha1: &details.description,
                },
            };
            let created: IssueResponse = self
                .http
                .post_json("/cobranca/v3/cobrancas", &auth, &body, &[])
                .await?;
            let reference = ProviderReference::new(created.codigo_solicitacao)?;

            // The slip lines come from a second call. Once the bank has
            // accepted the charge a failure here must not fail the issue.
            let detail = match self.detail(&reference).await {
                Ok(detail) => Some(detail),
                Err(e) => {
                    tracing::warn!(
                        charge_id = %details.charge_id,
                        reference = %reference,
                        error = %e,
                        "boleto issued but slip details unavailable"
                    );
                    None
                }
            };

            Ok(IssuedCharge {
                instrument: instrument(&reference, detail.as_ref()),
                reference,
            })
        })
    }

    fn fetch_status<'a>(
        &'a self,
        reference: &'a ProviderReference,
    ) -> ProviderFuture<'a, FetchedStatus> {
        Box::pin(async move {
            let detail = self.detail(reference).await?;
            Ok(FetchedStatus {
                paid_amount: received_amount(detail.cobranca.valor_total_recebido)?,
                paid_at: parse_timestamp(detail.cobranca.data_situacao.as_deref()),
                native_status: detail.cobranca.situacao,
            })
        })
    }

    fn cancel<'a>(&'a self, reference: &'a ProviderReference) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let auth = self.bearer().await?;
            let body = serde_json::json!({ "motivoCancelamento": "ACERTOS" });
            self.http
                .send_empty(
                    reqwest::Method::POST,
                    &format!("/cobranca/v3/cobrancas/{}/cancelar", reference.as_str()),
                    &auth,
                    Some(&body),
                )
                .await
        })
    }
}

/// The bank posts an array of status changes. It sends no event id, so one
/// is derived from the fields that make a delivery unique.
pub fn parse_webhook(body: &[u8]) -> Result<Vec<WebhookNotification>, ChargeError> {
    let items: Vec<CallbackItem> = serde_json::from_slice(body).map_err(|e| unparseable("boleto", e))?;
    items
        .into_iter()
        .map(|item| {
            let event_id = EventId::derived(
                ProviderType::Boleto,
                &[
                    item.codigo_solicitacao.as_str(),
                    item.situacao.as_str(),
                    item.data_hora_situacao.as_deref().unwrap_or(""),
                ],
            );
            Ok(WebhookNotification {
                event_id,
                reference: ProviderReference::new(item.codigo_solicitacao)?,
                paid_amount: received_amount(item.valor_total_recebido)?,
                paid_at: parse_timestamp(item.data_hora_situacao.as_deref()),
                native_status: item.situacao,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        charge::Payer,
        id::{ChargeId, EstablishmentId},
        money::Money,
    };
    use chrono::{NaiveDate, Utc};
    use httpmock::prelude::*;
    use serde_json::json;

    fn adapter(server: &MockServer) -> BoletoAdapter {
        let credential = crate::domain::credential::NewGatewayCredential {
            establishment_id: EstablishmentId::new(1).unwrap(),
            provider_type: ProviderType::Boleto,
            secret: CredentialSecret::OAuthMtls {
                client_id: "cid".into(),
                client_secret: "csecret".into(),
                certificate_pem: String::new(),
                private_key_pem: String::new(),
            },
            base_url: Some(server.base_url()),
            expires_at: None,
        }
        .into_active(Utc::now());
        BoletoAdapter::new(&credential, &AdapterSettings::for_tests()).unwrap()
    }

    fn token_mock(server: &MockServer) -> httpmock::Mock<'_> {
        server.mock(|when, then| {
            when.method(POST)
                .path("/oauth/v2/token")
                .body_contains("grant_type=client_credentials");
            then.status(200)
                .json_body(json!({"access_token": "tok-1", "token_type": "Bearer", "expires_in": 3600}));
        })
    }

    fn details() -> ChargeDetails {
        ChargeDetails {
            charge_id: ChargeId::generate(),
            establishment_id: EstablishmentId::new(1).unwrap(),
            amount: Money::from_cents(70000).unwrap(),
            due_date: NaiveDate::from_ymd_opt(2025, 4, 10).unwrap(),
            description: "Royalties 01/03/2025 a 31/03/2025".into(),
            possibly_issued: false,
            payer: Payer {
                name: "Padaria Central".into(),
                document: "12345678000195".into(),
                email: "fin@padaria.example".into(),
            },
        }
    }

    #[tokio::test]
    async fn issues_and_reads_slip_lines() {
        let server = MockServer::start();
        let token = token_mock(&server);
        let create = server.mock(|when, then| {
            when.method(POST)
                .path("/cobranca/v3/cobrancas")
                .header("authorization", "Bearer tok-1")
                .json_body_partial(r#"{"pagador": {"tipoPessoa": "JURIDICA"}}"#);
            then.status(200).json_body(json!({"codigoSolicitacao": "abc123"}));
        });
        let detail = server.mock(|when, then| {
            when.method(GET).path("/cobranca/v3/cobrancas/abc123");
            then.status(200).json_body(json!({
                "cobranca": {"situacao": "A_RECEBER"},
                "boleto": {"linhaDigitavel": "0019000", "codigoBarras": "001999", "nossoNumero": "42"},
                "pix": {"pixCopiaECola": "000201"}
            }));
        });

        let adapter = adapter(&server);
        let key = IdempotencyKey::from_stored("f".repeat(64));
        let issued = adapter.issue_charge(&details(), &key).await.unwrap();

        assert_eq!(issued.reference.as_str(), "abc123");
        assert_eq!(issued.instrument.as_json()["linha_digitavel"], "0019000");
        // One token fetch serves both calls.
        token.assert_hits(1);
        create.assert();
        detail.assert();
    }

    #[tokio::test]
    async fn reissue_reuses_charge_found_by_our_number() {
        let server = MockServer::start();
        token_mock(&server);
        let lookup = server.mock(|when, then| {
            when.method(GET)
                .path("/cobranca/v3/cobrancas")
                .query_param("seuNumero", "fffffffffffffff")
                .query_param("dataInicial", "2025-04-10")
                .query_param("filtrarDataPor", "VENCIMENTO");
            then.status(200).json_body(json!({
                "totalPaginas": 1,
                "cobrancas": [{
                    "cobranca": {
                        "codigoSolicitacao": "abc123",
                        "seuNumero": "fffffffffffffff",
                        "situacao": "A_RECEBER"
                    },
                    "boleto": {"linhaDigitavel": "0019000"}
                }]
            }));
        });
        let create = server.mock(|when, then| {
            when.method(POST).path("/cobranca/v3/cobrancas");
            then.status(200).json_body(json!({"codigoSolicitacao": "other"}));
        });

        let details = ChargeDetails {
            possibly_issued: true,
            ..details()
        };
        let key = IdempotencyKey::from_stored("f".repeat(64));
        let issued = adapter(&server).issue_charge(&details, &key).await.unwrap();

        assert_eq!(issued.reference.as_str(), "abc123");
        assert_eq!(issued.instrument.as_json()["linha_digitavel"], "0019000");
        lookup.assert();
        create.assert_hits(0);
    }

    #[tokio::test]
    async fn reissue_posts_when_only_a_canceled_copy_exists() {
        let server = MockServer::start();
        token_mock(&server);
        let lookup = server.mock(|when, then| {
            when.method(GET).path("/cobranca/v3/cobrancas");
            then.status(200).json_body(json!({
                "cobrancas": [{
                    "cobranca": {
                        "codigoSolicitacao": "old111",
                        "seuNumero": "fffffffffffffff",
                        "situacao": "CANCELADO"
                    }
                }]
            }));
        });
        let create = server.mock(|when, then| {
            when.method(POST).path("/cobranca/v3/cobrancas");
            then.status(200).json_body(json!({"codigoSolicitacao": "def456"}));
        });
        server.mock(|when, then| {
            when.method(GET).path("/cobranca/v3/cobrancas/def456");
            then.status(200).json_body(json!({"cobranca": {"situacao": "A_RECEBER"}}));
        });

        let details = ChargeDetails {
            possibly_issued: true,
            ..details()
        };
        let key = IdempotencyKey::from_stored("f".repeat(64));
        let issued = adapter(&server).issue_charge(&details, &key).await.unwrap();

        assert_eq!(issued.reference.as_str(), "def456");
        lookup.assert();
        create.assert();
    }

    #[tokio::test]
    async fn failed_lookup_does_not_post() {
        let server = MockServer::start();
        token_mock(&server);
        server.mock(|when, then| {
            when.method(GET).path("/cobranca/v3/cobrancas");
            then.status(503);
        });
        let create = server.mock(|when, then| {
            when.method(POST).path("/cobranca/v3/cobrancas");
            then.status(200).json_body(json!({"codigoSolicitacao": "def456"}));
        });

        let details = ChargeDetails {
            possibly_issued: true,
            ..details()
        };
        let err = adapter(&server)
            .issue_charge(&details, &IdempotencyKey::from_stored("k"))
            .await
            .unwrap_err();
        assert!(err.is_transient(), "got {err:?}");
        create.assert_hits(0);
    }

    #[tokio::test]
    async fn issue_survives_missing_slip_details() {
        let server = MockServer::start();
        token_mock(&server);
        server.mock(|when, then| {
            when.method(POST).path("/cobranca/v3/cobrancas");
            then.status(200).json_body(json!({"codigoSolicitacao": "abc123"}));
        });
        server.mock(|when, then| {
            when.method(GET).path("/cobranca/v3/cobrancas/abc123");
            then.status(500);
        });

        let issued = adapter(&server)
            .issue_charge(&details(), &IdempotencyKey::from_stored("k"))
            .await
            .unwrap();
        assert_eq!(issued.reference.as_str(), "abc123");
        assert!(issued.instrument.as_json()["linha_digitavel"].is_null());
    }

    #[tokio::test]
    async fn rejected_credentials_are_authentication_errors() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/oauth/v2/token");
            then.status(401).body("invalid_client");
        });

        let result = adapter(&server).authenticate().await;
        assert!(matches!(result, Err(ChargeError::Authentication(_))));
    }

    #[tokio::test]
    async fn fetch_reports_received_amount() {
        let server = MockServer::start();
        token_mock(&server);
        server.mock(|when, then| {
            when.method(GET).path("/cobranca/v3/cobrancas/abc123");
            then.status(200).json_body(json!({
                "cobranca": {"situacao": "RECEBIDO", "valorTotalRecebido": 700.0, "dataSituacao": "2025-04-05"}
            }));
        });

        let status = adapter(&server)
            .fetch_status(&ProviderReference::new("abc123").unwrap())
            .await
            .unwrap();
        assert_eq!(status.native_status, "RECEBIDO");
        assert_eq!(status.paid_amount.unwrap().to_string(), "700.00");
        assert!(status.paid_at.is_some());
    }

    #[test]
    fn webhook_items_get_stable_derived_ids() {
        let body = br#"[
            {"codigoSolicitacao": "abc123", "situacao": "RECEBIDO",
             "dataHoraSituacao": "2025-04-05T10:00:00-03:00", "valorTotalRecebido": "700.00"},
            {"codigoSolicitacao": "def456", "situacao": "CANCELADO"}
        ]"#;
        let first = parse_webhook(body).unwrap();
        let again = parse_webhook(body).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].event_id, again[0].event_id);
        assert_ne!(first[0].event_id, first[1].event_id);
        assert_eq!(first[0].paid_amount.unwrap().to_string(), "700.00");
        assert!(first[1].paid_amount.is_none());
    }

    #[test]
    fn webhook_garbage_is_a_validation_error() {
        assert!(matches!(parse_webhook(b"{not json"), Err(ChargeError::Validation(_))));
    }
}
