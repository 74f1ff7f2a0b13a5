//! Slider CAPTCHA gate shared by providers whose login pages can answer with a challenge.

use scout_captcha::ChallengeImage;
use scout_core::ScoutError;
use scout_storage::{FetchedResponse, HttpRequest, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{check_status, cookie_header, merge_cookies, send, transport_error, ProviderContext};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptchaChallenge {
    pub id: String,
    pub challenge_url: String,
    pub piece_url: String,
    pub verify_url: String,
}

#[derive(Debug, Deserialize)]
struct ChallengeEnvelope {
    captcha: CaptchaChallenge,
}

fn parse_challenge(response: &FetchedResponse) -> Option<CaptchaChallenge> {
    response
        .json::<ChallengeEnvelope>()
        .ok()
        .map(|envelope| envelope.captcha)
}

/// A 403/429 answer whose body carries a `captcha` object.
pub fn detect_challenge(response: &FetchedResponse) -> Option<CaptchaChallenge> {
    if !matches!(response.status, StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS) {
        return None;
    }
    parse_challenge(response)
}

/// Solves the challenge and returns the clearance cookies the verify endpoint sets.
///
/// Each round downloads both images, runs the solver and submits the estimate if it is
/// confident enough. Rejected rounds continue with the fresh challenge in the verify
/// response, or the same one when none is offered.
pub async fn clear_challenge(
    ctx: &ProviderContext,
    tag: &str,
    challenge: CaptchaChallenge,
) -> Result<Vec<(String, String)>, ScoutError> {
    let Some(solver) = ctx.solver.as_ref() else {
        return Err(ScoutError::authentication(
            tag,
            "captcha challenge received but no solver is configured",
        ));
    };
    let policy = ctx.config.captcha;
    let mut challenge = challenge;

    for round in 1..=policy.max_attempts {
        let challenge_bytes = ctx
            .http
            .fetch_bytes(tag, &challenge.challenge_url)
            .await
            .map_err(|err| transport_error(tag, err))?;
        let piece_bytes = ctx
            .http
            .fetch_bytes(tag, &challenge.piece_url)
            .await
            .map_err(|err| transport_error(tag, err))?;

        let attempt = solver
            .solve(
                ChallengeImage::new(challenge.challenge_url.clone(), challenge_bytes),
                ChallengeImage::new(challenge.piece_url.clone(), piece_bytes),
                Some(json!({ "provider": tag, "captcha_id": challenge.id, "round": round })),
            )
            .await?;

        if attempt.confidence < policy.confidence_threshold {
            debug!(
                provider = tag,
                round,
                confidence = attempt.confidence,
                "captcha estimate below threshold; not submitting"
            );
            solver.validate_result(attempt.id, false, None).await?;
            continue;
        }

        let verify = HttpRequest::post(&challenge.verify_url)
            .json(json!({ "captcha_id": challenge.id, "offset": attempt.estimated_position }))
            .no_retries();
        let response = ctx
            .http
            .execute(tag, &verify)
            .await
            .map_err(|err| transport_error(tag, err))?;

        if response.is_success() {
            solver
                .validate_result(attempt.id, true, Some(attempt.estimated_position))
                .await?;
            info!(provider = tag, round, "captcha cleared");
            return Ok(response.cookies());
        }

        solver.validate_result(attempt.id, false, None).await?;
        warn!(provider = tag, round, status = %response.status, "captcha answer rejected");
        if let Some(next) = parse_challenge(&response) {
            challenge = next;
        }
    }

    Err(ScoutError::authentication(
        tag,
        format!("captcha not solved after {} attempts", policy.max_attempts),
    ))
}

/// Sends `request`, clearing at most one CAPTCHA on the way. Returns the status-checked
/// response together with every cookie collected, clearance cookies included.
pub async fn fetch_through_challenge(
    ctx: &ProviderContext,
    tag: &str,
    request: HttpRequest,
) -> Result<(FetchedResponse, Vec<(String, String)>), ScoutError> {
    let response = send(ctx, tag, &request).await?;
    let Some(challenge) = detect_challenge(&response) else {
        let response = check_status(tag, response)?;
        let cookies = response.cookies();
        return Ok((response, cookies));
    };

    let clearance = merge_cookies(response.cookies(), clear_challenge(ctx, tag, challenge).await?);
    let retry = request.header("Cookie", cookie_header(&clearance));
    let response = send(ctx, tag, &retry).await?;
    if detect_challenge(&response).is_some() {
        return Err(ScoutError::authentication(
            tag,
            "challenge repeated after clearance",
        ));
    }
    let response = check_status(tag, response)?;
    let cookies = merge_cookies(clearance, response.cookies());
    Ok((response, cookies))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixed_estimator, ScriptedTransport};
    use scout_core::AttemptOutcome;
    use scout_storage::HttpMethod;
    use std::sync::Arc;

    fn challenge(id: &str) -> CaptchaChallenge {
        CaptchaChallenge {
            id: id.into(),
            challenge_url: format!("https://captcha.test/{id}/bg.png"),
            piece_url: format!("https://captcha.test/{id}/piece.png"),
            verify_url: "https://captcha.test/verify".into(),
        }
    }

    fn script_images(transport: &ScriptedTransport, c: &CaptchaChallenge) {
        transport.on(HttpMethod::Get, &c.challenge_url, FetchedResponse::new(StatusCode::OK, &c.challenge_url, b"bg".to_vec()));
        transport.on(HttpMethod::Get, &c.piece_url, FetchedResponse::new(StatusCode::OK, &c.piece_url, b"piece".to_vec()));
    }

    #[test]
    fn detects_challenge_only_on_blocking_statuses() {
        let body = serde_json::to_vec(&json!({ "captcha": challenge("c1") })).unwrap();
        let blocked = FetchedResponse::new(StatusCode::FORBIDDEN, "https://x.test", body.clone());
        assert_eq!(detect_challenge(&blocked), Some(challenge("c1")));
        let ok = FetchedResponse::new(StatusCode::OK, "https://x.test", body);
        assert_eq!(detect_challenge(&ok), None);
        let plain = FetchedResponse::new(StatusCode::FORBIDDEN, "https://x.test", b"denied".to_vec());
        assert_eq!(detect_challenge(&plain), None);
    }

    #[tokio::test]
    async fn successful_answer_returns_clearance_cookies() {
        let transport = Arc::new(ScriptedTransport::new());
        let c = challenge("c1");
        script_images(&transport, &c);
        transport.on(
            HttpMethod::Post,
            &c.verify_url,
            FetchedResponse::new(StatusCode::OK, &c.verify_url, b"{}".to_vec())
                .with_header("set-cookie", "datadome=clear; Path=/"),
        );
        let (ctx, repository) = crate::testing::context(transport.clone(), Some(fixed_estimator(64, 0.9)));

        let cookies = clear_challenge(&ctx, "leboncoin", c).await.unwrap();
        assert_eq!(cookies, vec![("datadome".to_string(), "clear".to_string())]);

        let submitted = transport.requests_to("https://captcha.test/verify");
        assert_eq!(submitted.len(), 1);
        assert_eq!(
            submitted[0].body,
            Some(scout_storage::RequestBody::Json(json!({ "captcha_id": "c1", "offset": 64 })))
        );
        let attempts = repository.list_attempts().await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].outcome, AttemptOutcome::Success);
        assert_eq!(attempts[0].actual_position, Some(64));
    }

    #[tokio::test]
    async fn low_confidence_rounds_are_never_submitted() {
        let transport = Arc::new(ScriptedTransport::new());
        let c = challenge("c1");
        script_images(&transport, &c);
        let (ctx, repository) = crate::testing::context(transport.clone(), Some(fixed_estimator(10, 0.1)));

        let err = clear_challenge(&ctx, "vinted", c).await.unwrap_err();
        assert!(matches!(err, ScoutError::Authentication { .. }));
        assert!(transport.requests_to("https://captcha.test/verify").is_empty());

        let attempts = repository.list_attempts().await.unwrap();
        assert_eq!(attempts.len(), 3);
        assert!(attempts.iter().all(|a| a.outcome == AttemptOutcome::Failure));
    }

    #[tokio::test]
    async fn rejected_answers_switch_to_the_fresh_challenge() {
        let transport = Arc::new(ScriptedTransport::new());
        let first = challenge("c1");
        let second = challenge("c2");
        script_images(&transport, &first);
        script_images(&transport, &second);
        let retry_body = serde_json::to_vec(&json!({ "captcha": second })).unwrap();
        transport.on(HttpMethod::Post, &first.verify_url, FetchedResponse::new(StatusCode::FORBIDDEN, &first.verify_url, retry_body));
        transport.on(HttpMethod::Post, &first.verify_url, FetchedResponse::new(StatusCode::OK, &first.verify_url, b"{}".to_vec()));
        let (ctx, repository) = crate::testing::context(transport.clone(), Some(fixed_estimator(30, 0.8)));

        clear_challenge(&ctx, "vinted", first).await.unwrap();

        assert_eq!(transport.requests_to(&second.challenge_url).len(), 1);
        let outcomes: Vec<_> = repository
            .list_attempts()
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.outcome)
            .collect();
        assert_eq!(outcomes, vec![AttemptOutcome::Failure, AttemptOutcome::Success]);
    }

    #[tokio::test]
    async fn missing_solver_is_an_authentication_error() {
        let transport = Arc::new(ScriptedTransport::new());
        let (ctx, _) = crate::testing::context(transport, None);
        let err = clear_challenge(&ctx, "vinted", challenge("c1")).await.unwrap_err();
        assert!(matches!(err, ScoutError::Authentication { .. }));
    }
}
