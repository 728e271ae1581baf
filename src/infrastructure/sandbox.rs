//! An in-process card processor.
//!
//! Keeps its own book of captured payments and applies the rules a real
//! processor enforces: basket totals must match the price, settled payments
//! cannot be voided, refunds cannot exceed what was captured. Tests steer it
//! with [`SandboxGateway::decline_card`], [`SandboxGateway::fail_next`] and
//! [`SandboxGateway::stall_next`].

use crate::domain::gateway::{
    BkmSession, DeleteCardRequest, GatewayError, GatewayResult, PaymentGateway, PaymentItem,
    PaymentRequest, PaymentResult, RefundRequest, RefundResult, StoreCardRequest,
    StoredCardResult, ThreedsConfirmRequest, ThreedsSession, VoidRequest, VoidResult,
};
use crate::domain::transaction::{Transaction, TransactionStatus};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// Cards whose token starts with this prefix are always declined.
pub const DECLINED_TOKEN_PREFIX: &str = "sbx-decline";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayOperation {
    CreatePayment,
    InitializeThreeds,
    ConfirmThreeds,
    InitializeBkm,
    RetrieveBkm,
    CreateVoid,
    CreateRefund,
    CreateStoredCard,
    DeleteStoredCard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxPayment {
    pub amount: Decimal,
    pub refunded: Decimal,
    pub voided: bool,
    pub settled: bool,
}

#[derive(Default)]
struct SandboxState {
    sequence: u64,
    payments: HashMap<String, SandboxPayment>,
    /// Payment item transaction id to payment reference.
    items: HashMap<String, String>,
    threeds_sessions: HashMap<String, PaymentRequest>,
    bkm_sessions: HashMap<String, PaymentRequest>,
    declined_cards: HashMap<String, String>,
    failures: HashMap<GatewayOperation, VecDeque<GatewayError>>,
    stalls: HashSet<GatewayOperation>,
    /// Amounts reported by upcoming voids instead of the captured amount.
    void_amounts: VecDeque<Decimal>,
    calls: HashMap<GatewayOperation, usize>,
}

impl SandboxState {
    fn next(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn authorize(&self, request: &PaymentRequest) -> GatewayResult<()> {
        let token = &request.card.card_token;
        if let Some(message) = self.declined_cards.get(token) {
            return Err(GatewayError::declined(message.clone()));
        }
        if token.starts_with(DECLINED_TOKEN_PREFIX) {
            return Err(GatewayError::declined("Card declined by issuer"));
        }

        let basket: Decimal = request.basket_items.iter().map(|item| item.price).sum();
        if basket != request.price {
            return Err(GatewayError::declined(
                "Basket items total does not match the price",
            ));
        }
        Ok(())
    }

    fn book(&mut self, request: &PaymentRequest) -> PaymentResult {
        let n = self.next();
        let reference_key = format!("sbx-pay-{n}");

        let payment_items = request
            .basket_items
            .iter()
            .enumerate()
            .map(|(i, item)| PaymentItem {
                item_id: item.id.clone(),
                payment_transaction_id: format!("sbx-ptx-{n}-{}", i + 1),
                price: item.price,
            })
            .collect::<Vec<_>>();
        for item in &payment_items {
            self.items
                .insert(item.payment_transaction_id.clone(), reference_key.clone());
        }

        self.payments.insert(
            reference_key.clone(),
            SandboxPayment {
                amount: request.paid_price,
                refunded: Decimal::ZERO,
                voided: false,
                settled: false,
            },
        );

        PaymentResult {
            reference_key,
            paid_price: request.paid_price,
            payment_items,
        }
    }
}

/// Cloning shares the same payment book.
#[derive(Default, Clone)]
pub struct SandboxGateway {
    state: Arc<Mutex<SandboxState>>,
}

impl SandboxGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declines every payment attempted with `token`.
    pub async fn decline_card(&self, token: &str, message: &str) {
        let mut state = self.state.lock().await;
        state
            .declined_cards
            .insert(token.to_string(), message.to_string());
    }

    /// Makes the next call of `operation` fail with `error`.
    pub async fn fail_next(&self, operation: GatewayOperation, error: GatewayError) {
        let mut state = self.state.lock().await;
        state.failures.entry(operation).or_default().push_back(error);
    }

    /// Makes the next call of `operation` hang until the caller gives up.
    pub async fn stall_next(&self, operation: GatewayOperation) {
        let mut state = self.state.lock().await;
        state.stalls.insert(operation);
    }

    /// Makes the next successful void report `amount` as cancelled.
    pub async fn report_void_amount(&self, amount: Decimal) {
        let mut state = self.state.lock().await;
        state.void_amounts.push_back(amount);
    }

    /// Settles every captured payment; from then on they can only be refunded.
    pub async fn settle_all(&self) {
        let mut state = self.state.lock().await;
        for payment in state.payments.values_mut() {
            payment.settled = true;
        }
    }

    /// Books a payment captured before this gateway was started, so seeded
    /// transactions can still be voided and refunded.
    pub async fn adopt(&self, tx: &Transaction) {
        let (Some(reference_key), Some(item)) = (&tx.gateway_reference, &tx.gateway_transaction_id)
        else {
            return;
        };
        if !matches!(
            tx.status,
            TransactionStatus::Success | TransactionStatus::PartialRefunded | TransactionStatus::Voided
        ) {
            return;
        }

        let mut state = self.state.lock().await;
        state.items.insert(item.clone(), reference_key.clone());
        state.payments.insert(
            reference_key.clone(),
            SandboxPayment {
                amount: tx.amount.value(),
                refunded: tx.ledger().refunded_amount().value(),
                voided: tx.status == TransactionStatus::Voided,
                settled: false,
            },
        );
    }

    pub async fn payment(&self, reference_key: &str) -> Option<SandboxPayment> {
        let state = self.state.lock().await;
        state.payments.get(reference_key).cloned()
    }

    pub async fn calls(&self, operation: GatewayOperation) -> usize {
        let state = self.state.lock().await;
        state.calls.get(&operation).copied().unwrap_or(0)
    }

    /// Counts the call and applies any scripted failure or stall.
    async fn enter(&self, operation: GatewayOperation) -> GatewayResult<MutexGuard<'_, SandboxState>> {
        let mut state = self.state.lock().await;
        *state.calls.entry(operation).or_default() += 1;

        if state.stalls.remove(&operation) {
            drop(state);
            let never: Infallible = std::future::pending().await;
            match never {}
        }
        if let Some(error) = state
            .failures
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        Ok(state)
    }
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    async fn create_payment(&self, request: PaymentRequest) -> GatewayResult<PaymentResult> {
        let mut state = self.enter(GatewayOperation::CreatePayment).await?;
        state.authorize(&request)?;
        Ok(state.book(&request))
    }

    async fn initialize_threeds(&self, request: PaymentRequest) -> GatewayResult<ThreedsSession> {
        let mut state = self.enter(GatewayOperation::InitializeThreeds).await?;
        state.authorize(&request)?;

        let reference_key = format!("sbx-3ds-{}", state.next());
        let callback = request.callback_url.clone().unwrap_or_default();
        let html_content = format!(
            "<form method=\"post\" action=\"{callback}\"><input type=\"hidden\" name=\"paymentId\" value=\"{reference_key}\"></form>"
        );
        state.threeds_sessions.insert(reference_key.clone(), request);
        Ok(ThreedsSession {
            reference_key,
            html_content,
        })
    }

    async fn confirm_threeds(&self, request: ThreedsConfirmRequest) -> GatewayResult<PaymentResult> {
        let mut state = self.enter(GatewayOperation::ConfirmThreeds).await?;
        let session = state
            .threeds_sessions
            .remove(&request.payment_id)
            .ok_or_else(|| GatewayError::declined("3-D Secure session not found"))?;
        if session.conversation_id != request.conversation_id {
            return Err(GatewayError::declined("Conversation id mismatch"));
        }
        Ok(state.book(&session))
    }

    async fn initialize_bkm(&self, request: PaymentRequest) -> GatewayResult<BkmSession> {
        let mut state = self.enter(GatewayOperation::InitializeBkm).await?;
        state.authorize(&request)?;

        let n = state.next();
        let token = format!("sbx-bkm-token-{n}");
        let html_content = format!("<form action=\"https://sandbox.bkm/express?token={token}\"></form>");
        state.bkm_sessions.insert(token.clone(), request);
        Ok(BkmSession {
            reference_key: format!("sbx-bkm-{n}"),
            token,
            html_content,
        })
    }

    async fn retrieve_bkm(&self, token: &str) -> GatewayResult<PaymentResult> {
        let mut state = self.enter(GatewayOperation::RetrieveBkm).await?;
        let session = state
            .bkm_sessions
            .remove(token)
            .ok_or_else(|| GatewayError::declined("BKM session not found"))?;
        Ok(state.book(&session))
    }

    async fn create_void(&self, request: VoidRequest) -> GatewayResult<VoidResult> {
        let mut state = self.enter(GatewayOperation::CreateVoid).await?;
        let payment = state
            .payments
            .get_mut(&request.reference_key)
            .ok_or_else(|| GatewayError::declined("Payment not found"))?;

        if payment.voided {
            return Err(GatewayError::declined("Payment already cancelled"));
        }
        if payment.settled || !payment.refunded.is_zero() {
            return Err(GatewayError::declined(
                "Payment already settled, it can only be refunded",
            ));
        }
        payment.voided = true;
        let captured = payment.amount;
        Ok(VoidResult {
            reference_key: request.reference_key,
            amount: state.void_amounts.pop_front().unwrap_or(captured),
        })
    }

    async fn create_refund(&self, request: RefundRequest) -> GatewayResult<RefundResult> {
        let mut state = self.enter(GatewayOperation::CreateRefund).await?;
        let reference = state
            .items
            .get(&request.payment_transaction_id)
            .cloned()
            .ok_or_else(|| GatewayError::declined("Payment transaction not found"))?;
        let n = state.next();
        let payment = state
            .payments
            .get_mut(&reference)
            .ok_or_else(|| GatewayError::declined("Payment not found"))?;

        if payment.voided {
            return Err(GatewayError::declined("Cancelled payments cannot be refunded"));
        }
        if request.amount > payment.amount - payment.refunded {
            return Err(GatewayError::declined(
                "Refund amount exceeds the captured amount",
            ));
        }
        payment.refunded += request.amount;
        Ok(RefundResult {
            reference_key: format!("sbx-refund-{n}"),
            payment_transaction_id: request.payment_transaction_id,
            amount: request.amount,
        })
    }

    async fn create_stored_card(&self, request: StoreCardRequest) -> GatewayResult<StoredCardResult> {
        let mut state = self.enter(GatewayOperation::CreateStoredCard).await?;
        let n = state.next();

        let number = &request.number;
        let network = match number.chars().next() {
            Some('4') => Some("VISA".to_string()),
            Some('5') => Some("MASTER_CARD".to_string()),
            Some('3') => Some("AMERICAN_EXPRESS".to_string()),
            _ => None,
        };
        Ok(StoredCardResult {
            card_user_key: request
                .card_user_key
                .unwrap_or_else(|| format!("sbx-user-{n}")),
            token: format!("sbx-card-{n}"),
            alias: request.alias,
            bin: number.get(..6).unwrap_or_default().to_string(),
            last_four: number
                .get(number.len().saturating_sub(4)..)
                .unwrap_or_default()
                .to_string(),
            network,
            bank: Some("Sandbox Bank".to_string()),
        })
    }

    async fn delete_stored_card(&self, _request: DeleteCardRequest) -> GatewayResult<()> {
        let _state = self.enter(GatewayOperation::DeleteStoredCard).await?;
        Ok(())
    }
}
