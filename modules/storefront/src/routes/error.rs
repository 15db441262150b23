//! HTTP error mapping
//!
//! Every handler error becomes `{"error": code, "message": text}`. Messages
//! carry English and Arabic text; [`localize_errors`] swaps in the Arabic
//! message when the client asks for it via `Accept-Language`.

use axum::{
    extract::Request,
    http::{header::ACCEPT_LANGUAGE, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::normalize::NormalizeError;
use crate::services::chat_service::ChatError;
use crate::services::checkout_service::CheckoutError;
use crate::services::notification_service::NotificationError;
use crate::services::reward_service::RewardError;
use crate::services::wallet_service::LedgerError;
use crate::store::StoreError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub message_ar: String,
}

/// Attached to error responses so the middleware can re-render them
#[derive(Debug, Clone)]
struct LocalizedError {
    code: &'static str,
    message_ar: String,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        message_ar: impl Into<String>,
    ) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            message_ar: message_ar.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "validation_error",
            message,
            "البيانات المدخلة غير صالحة",
        )
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "not_found",
            message,
            "العنصر المطلوب غير موجود",
        )
    }

    fn invalid_user() -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "invalid_user",
            "Invalid user id",
            "معرّف المستخدم غير صالح",
        )
    }

    fn insufficient_balance(message: String) -> Self {
        Self::new(
            StatusCode::CONFLICT,
            "insufficient_balance",
            message,
            "رصيد المحفظة غير كافٍ",
        )
    }

    fn internal(message: String) -> Self {
        tracing::error!(error = %message, "Request failed with an internal error");
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "Internal server error",
            "حدث خطأ، يرجى المحاولة مرة أخرى",
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (
            self.status,
            Json(ErrorResponse {
                error: self.code.to_string(),
                message: self.message,
            }),
        )
            .into_response();

        response.extensions_mut().insert(LocalizedError {
            code: self.code,
            message_ar: self.message_ar,
        });
        response
    }
}

/// Re-render error bodies in Arabic for `Accept-Language: ar*` requests
pub async fn localize_errors(request: Request, next: Next) -> Response {
    let wants_arabic = request
        .headers()
        .get(ACCEPT_LANGUAGE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase().starts_with("ar"))
        .unwrap_or(false);

    let mut response = next.run(request).await;
    if !wants_arabic {
        return response;
    }

    match response.extensions_mut().remove::<LocalizedError>() {
        Some(localized) => (
            response.status(),
            Json(ErrorResponse {
                error: localized.code.to_string(),
                message: localized.message_ar,
            }),
        )
            .into_response(),
        None => response,
    }
}

// ============================================================================
// DOMAIN ERROR MAPPING
// ============================================================================

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ApiError::not_found(format!("Not found: {}", what)),
            StoreError::InsufficientFunds { .. } => ApiError::insufficient_balance(err.to_string()),
            StoreError::InsufficientPoints { .. } => ApiError::new(
                StatusCode::CONFLICT,
                "insufficient_points",
                err.to_string(),
                "رصيد النقاط غير كافٍ",
            ),
            StoreError::EmptyCart => ApiError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "empty_cart",
                "Cart is empty",
                "سلة التسوق فارغة",
            ),
            StoreError::ProductUnavailable(id) => product_unavailable(id),
            StoreError::Conflict(message) => ApiError::new(
                StatusCode::CONFLICT,
                "conflict",
                message,
                "تم تعديل البيانات من مكان آخر، حاول مرة أخرى",
            ),
            StoreError::AmountOutOfRange(_) => ApiError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "invalid_amount",
                err.to_string(),
                "المبلغ غير صالح",
            ),
            StoreError::Database(_) | StoreError::Unavailable(_) => {
                ApiError::internal(err.to_string())
            }
        }
    }
}

fn product_unavailable(product_id: String) -> ApiError {
    ApiError::new(
        StatusCode::CONFLICT,
        "product_unavailable",
        format!("Product unavailable: {}", product_id),
        "المنتج غير متوفر حالياً",
    )
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InvalidUser => ApiError::invalid_user(),
            LedgerError::ZeroAmount | LedgerError::InvalidSign { .. } => ApiError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "invalid_amount",
                err.to_string(),
                "المبلغ غير صالح",
            ),
            LedgerError::MissingReason => ApiError::validation(err.to_string()),
            LedgerError::InsufficientBalance { .. } => {
                ApiError::insufficient_balance(err.to_string())
            }
            LedgerError::InsufficientPoints { .. } => ApiError::new(
                StatusCode::CONFLICT,
                "insufficient_points",
                err.to_string(),
                "رصيد النقاط غير كافٍ",
            ),
            LedgerError::Store(e) => e.into(),
        }
    }
}

impl From<RewardError> for ApiError {
    fn from(err: RewardError) -> Self {
        match err {
            RewardError::InvalidUser => ApiError::invalid_user(),
            RewardError::NegativeCount(_) => ApiError::validation(err.to_string()),
            RewardError::NothingCaught => ApiError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "nothing_caught",
                err.to_string(),
                "لم تلتقط أي عنصر، حاول مرة أخرى",
            ),
            RewardError::AlreadyClaimed { .. } => ApiError::new(
                StatusCode::CONFLICT,
                "already_claimed",
                err.to_string(),
                "لقد حصلت على مكافأة اليوم بالفعل، عد غداً",
            ),
            RewardError::Store(e) => e.into(),
        }
    }
}

impl From<CheckoutError> for ApiError {
    fn from(err: CheckoutError) -> Self {
        match err {
            CheckoutError::InvalidUser => ApiError::invalid_user(),
            CheckoutError::InvalidQuantity { .. } => ApiError::validation(err.to_string()),
            CheckoutError::ProductNotFound(_)
            | CheckoutError::CartItemNotFound(_)
            | CheckoutError::OrderNotFound(_) => ApiError::not_found(err.to_string()),
            CheckoutError::ProductUnavailable(id) => product_unavailable(id),
            CheckoutError::MissingAddress => ApiError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "missing_address",
                err.to_string(),
                "يرجى إدخال عنوان التوصيل كاملاً",
            ),
            CheckoutError::EmptyCart => StoreError::EmptyCart.into(),
            CheckoutError::InsufficientBalance { .. } => {
                ApiError::insufficient_balance(err.to_string())
            }
            CheckoutError::InvalidTransition { .. } => ApiError::new(
                StatusCode::CONFLICT,
                "invalid_transition",
                err.to_string(),
                "لا يمكن نقل الطلب إلى هذه الحالة",
            ),
            CheckoutError::Store(e) => e.into(),
        }
    }
}

impl From<NotificationError> for ApiError {
    fn from(err: NotificationError) -> Self {
        match err {
            NotificationError::EmptyTitle
            | NotificationError::EmptyBody
            | NotificationError::InvalidAudience => ApiError::validation(err.to_string()),
            NotificationError::InvalidUser => ApiError::invalid_user(),
            NotificationError::NotFound(_) => ApiError::not_found(err.to_string()),
            NotificationError::Store(e) => e.into(),
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::EmptyConversation => ApiError::validation(err.to_string()),
            other => {
                tracing::warn!(error = %other, "Chat reply failed");
                ApiError::new(
                    StatusCode::BAD_GATEWAY,
                    "chat_unavailable",
                    "The assistant is unavailable right now",
                    "المساعد غير متاح حالياً، حاول لاحقاً",
                )
            }
        }
    }
}

impl From<NormalizeError> for ApiError {
    fn from(err: NormalizeError) -> Self {
        ApiError::validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let err: ApiError = LedgerError::InsufficientBalance {
            available: 1,
            required: 2,
        }
        .into();
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.code, "insufficient_balance");

        let err: ApiError = CheckoutError::MissingAddress.into();
        assert_eq!(err.status, StatusCode::UNPROCESSABLE_ENTITY);

        let err: ApiError = StoreError::Unavailable("lock".into()).into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "Internal server error");

        let err: ApiError = ChatError::EmptyAnswer.into();
        assert_eq!(err.status, StatusCode::BAD_GATEWAY);
    }
}
