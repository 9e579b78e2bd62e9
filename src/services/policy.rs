//! Deterministic booking policy.
//!
//! The policy reads the resent conversation and decides the next move:
//! which tools to call, or the reply to give. It also renders the
//! instructions handed to a generative model so both paths follow the same
//! rules.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{Datelike, Duration, NaiveDate, NaiveTime, Weekday};
use regex::Regex;
use serde_json::{json, Value};

use crate::models::{ChatMessage, Role, ToolInvocation, ToolState};
use crate::services::tools::{
    BarbershopSummary, CheckoutOutput, ServiceSummary, TimeSlots, ToolName, DUPLICATE_BOOKING, UNAUTHORIZED,
};

pub const SUGGESTED_SLOTS: usize = 5;

pub const CHECKOUT_REDIRECT: &str = "Perfeito! Estou redirecionando você para o pagamento. Aguarde um momento...";
pub const CHECKOUT_LOGIN_REQUIRED: &str =
    "Para criar uma reserva é necessário fazer login. Entre na sua conta e confirme novamente.";
pub const CHECKOUT_ALREADY_CREATED: &str =
    "Já foi criado um agendamento para este horário. Confira em seus agendamentos!";
pub const CHECKOUT_FAILED: &str = "Houve um problema ao criar sua reserva. Por favor, tente novamente.";

static ISO_DATE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").unwrap());
static DAY_MONTH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,2})/(\d{1,2})(?:/(\d{4}))?\b").unwrap());
static TIME_OF_DAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b([01]?\d|2[0-3])\s*(?:horas?|h|:)\s*([0-5]\d)?").unwrap());

const CONFIRMATION_PHRASES: &[&str] = &[
    "confirmo",
    "confirmado",
    "pode agendar",
    "pode marcar",
    "pode reservar",
    "quero esse horário",
    "quero esse horario",
    "confirm",
];
const CONFIRMATION_WORDS: &[&str] = &["sim", "yes", "ok", "fechado"];

/// Next move for the conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyDecision {
    CallTools(Vec<PlannedCall>),
    Reply(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedCall {
    pub tool: ToolName,
    pub input: Value,
}

impl PlannedCall {
    fn new(tool: ToolName, input: Value) -> Self {
        Self { tool, input }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConversationPolicy {
    today: NaiveDate,
}

impl ConversationPolicy {
    /// `today` is fixed for the whole session; relative dates resolve
    /// against it.
    pub fn new(today: NaiveDate) -> Self {
        Self { today }
    }

    pub fn today(&self) -> NaiveDate {
        self.today
    }

    pub fn system_prompt(&self) -> String {
        format!(
            r#"Você é o Agenda.ai, um assistente virtual de agendamento de barbearias.

DATA ATUAL: hoje é {long} ({iso}).

Você ajuda os usuários a encontrar barbearias, consultar horários disponíveis e conhecer serviços e preços.

Quando o usuário mencionar uma data ou horário:
1. Use searchBarbershops para buscar as barbearias.
2. Em seguida use getAvailableTimeSlotsForBarbershop para CADA barbearia retornada, com a data mencionada.
3. Apresente APENAS as barbearias com horários disponíveis: nome, endereço, serviços com preços e 4-5 horários espaçados.
4. Se o usuário pediu um horário específico e alguma barbearia tem exatamente esse horário, apresente só essas e peça confirmação.

Quando o usuário não mencionar data:
1. Use searchBarbershops e apresente nome, endereço, serviços e preços.
2. Pergunte a data desejada antes de consultar horários.

Criação da reserva:
- Só use createCheckoutSession depois de uma confirmação explícita ("confirmo", "pode agendar", "quero esse horário").
- Use createCheckoutSession APENAS UMA VEZ por confirmação. Se já criou uma sessão nesta conversa, não crie outra.
- serviceId é o campo "id" do serviço retornado por searchBarbershops, nunca o nome.
- date é data e horário no formato YYYY-MM-DDTHH:mm:ss, por exemplo "{iso}T10:00:00".
- Sucesso: diga "{redirect}"
- Erro "{unauthorized}": explique que é preciso fazer login para reservar.
- Erro "{duplicate}": explique que já existe um agendamento para este horário.
- Outros erros: peça desculpas e sugira tentar novamente.

Regras:
- NUNCA mostre identificadores, datas em formato ISO ou URLs ao usuário.
- Não liste todos os horários; sugira 4-5 opções espaçadas ao longo do dia.
- Se não houver horários, sugira outra data.
- Calcule "hoje", "amanhã", "depois de amanhã" e dias da semana a partir da data atual.
- Seja educado, prestativo e use linguagem informal e amigável."#,
            long = format_date_long(self.today),
            iso = self.today.format("%Y-%m-%d"),
            redirect = CHECKOUT_REDIRECT,
            unauthorized = UNAUTHORIZED,
            duplicate = DUPLICATE_BOOKING,
        )
    }

    /// Resolves an explicit or relative date mentioned in `text`.
    pub fn resolve_date(&self, text: &str) -> Option<NaiveDate> {
        let lower = text.to_lowercase();

        if let Some(caps) = ISO_DATE.captures(&lower) {
            let (y, m, d) = (caps[1].parse().ok()?, caps[2].parse().ok()?, caps[3].parse().ok()?);
            if let Some(date) = NaiveDate::from_ymd_opt(y, m, d) {
                return Some(date);
            }
        }

        if let Some(caps) = DAY_MONTH.captures(&lower) {
            let d: u32 = caps[1].parse().ok()?;
            let m: u32 = caps[2].parse().ok()?;
            match caps.get(3) {
                Some(y) => {
                    if let Some(date) = NaiveDate::from_ymd_opt(y.as_str().parse().ok()?, m, d) {
                        return Some(date);
                    }
                }
                None => {
                    // Without a year, the next occurrence of that day.
                    let this_year = NaiveDate::from_ymd_opt(self.today.year(), m, d);
                    match this_year {
                        Some(date) if date >= self.today => return Some(date),
                        Some(_) => return NaiveDate::from_ymd_opt(self.today.year() + 1, m, d),
                        None => {}
                    }
                }
            }
        }

        if lower.contains("depois de amanhã") || lower.contains("depois de amanha") || lower.contains("day after tomorrow") {
            return Some(self.today + Duration::days(2));
        }

        let words: Vec<&str> = lower.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()).collect();
        let has = |candidates: &[&str]| words.iter().any(|w| candidates.contains(w));

        if has(&["amanhã", "amanha", "tomorrow"]) {
            return Some(self.today + Duration::days(1));
        }
        if has(&["hoje", "today"]) {
            return Some(self.today);
        }

        words
            .iter()
            .find_map(|w| weekday_from_word(w))
            .map(|weekday| self.next_weekday(weekday))
    }

    /// Resolves a time of day such as "10h", "10h30", "14:00" or "9 horas".
    pub fn resolve_time(&self, text: &str) -> Option<NaiveTime> {
        let caps = TIME_OF_DAY.captures(text)?;
        let hour = caps[1].parse().ok()?;
        let minute = caps.get(2).map_or(Some(0), |m| m.as_str().parse().ok())?;
        NaiveTime::from_hms_opt(hour, minute, 0)
    }

    pub fn suggest_time_slots(&self, slots: &[String], count: usize) -> Vec<String> {
        suggest_time_slots(slots, count)
    }

    /// True if any checkout was attempted after the latest user message.
    pub fn checkout_attempted_this_turn(&self, messages: &[ChatMessage]) -> bool {
        current_turn(messages)
            .flat_map(ChatMessage::tool_invocations)
            .any(|inv| inv.tool_name == ToolName::CreateCheckoutSession.as_str())
    }

    /// True if a checkout session was created after the latest user message.
    pub fn checkout_succeeded_this_turn(&self, messages: &[ChatMessage]) -> bool {
        checkout_result_this_turn(messages).is_some_and(|result| result.success)
    }

    pub fn plan(&self, messages: &[ChatMessage]) -> PolicyDecision {
        let Some(last_user) = messages.iter().rev().find(|m| m.role == Role::User) else {
            return PolicyDecision::Reply(
                "Olá! Sou o Agenda.ai. Posso te ajudar a encontrar uma barbearia e agendar um horário.".to_string(),
            );
        };
        let last_text = last_user.text();

        let catalog = match latest_catalog(messages) {
            None => {
                return PolicyDecision::CallTools(vec![PlannedCall::new(ToolName::SearchBarbershops, json!({}))]);
            }
            Some(Err(_)) => {
                return PolicyDecision::Reply(
                    "Não consegui buscar as barbearias agora. Tente novamente em instantes.".to_string(),
                );
            }
            Some(Ok(catalog)) => catalog,
        };

        if catalog.is_empty() {
            return PolicyDecision::Reply("Não encontrei barbearias cadastradas no momento.".to_string());
        }

        let user_texts: Vec<String> = messages
            .iter()
            .rev()
            .filter(|m| m.role == Role::User)
            .map(ChatMessage::text)
            .collect();
        let date = user_texts.iter().find_map(|t| self.resolve_date(t));
        let time = user_texts.iter().find_map(|t| self.resolve_time(t));

        if is_confirmation(&last_text) {
            if let Some(result) = checkout_result_this_turn(messages) {
                return PolicyDecision::Reply(narrate_checkout(&result).to_string());
            }
            if self.checkout_attempted_this_turn(messages) {
                return PolicyDecision::Reply(CHECKOUT_FAILED.to_string());
            }
            let (Some(date), Some(time)) = (date, time) else {
                return PolicyDecision::Reply(
                    "Para confirmar, me diga o dia e o horário que você prefere.".to_string(),
                );
            };

            let slots = known_slots(messages, date);
            let missing = missing_slot_lookups(&catalog, &slots, date);
            if !missing.is_empty() {
                return PolicyDecision::CallTools(missing);
            }

            return match select_booking(&catalog, &slots, time, &user_texts) {
                Some((_, service)) => PolicyDecision::CallTools(vec![PlannedCall::new(
                    ToolName::CreateCheckoutSession,
                    json!({
                        "serviceId": service.id,
                        "date": date.and_time(time).format("%Y-%m-%dT%H:%M:%S").to_string(),
                    }),
                )]),
                None => PolicyDecision::Reply(format!(
                    "O horário das {} em {} não está disponível. Quer escolher outro?",
                    time.format("%H:%M"),
                    format_date_long(date)
                )),
            };
        }

        let Some(date) = date else {
            return PolicyDecision::Reply(present_catalog(&catalog));
        };

        let slots = known_slots(messages, date);
        let missing = missing_slot_lookups(&catalog, &slots, date);
        if !missing.is_empty() {
            return PolicyDecision::CallTools(missing);
        }

        PolicyDecision::Reply(self.present_availability(&catalog, &slots, date, time))
    }

    fn next_weekday(&self, weekday: Weekday) -> NaiveDate {
        let ahead = (weekday.num_days_from_monday() + 7 - self.today.weekday().num_days_from_monday()) % 7;
        self.today + Duration::days(i64::from(ahead))
    }

    fn present_availability(
        &self,
        catalog: &[BarbershopSummary],
        slots: &HashMap<String, Vec<String>>,
        date: NaiveDate,
        time: Option<NaiveTime>,
    ) -> String {
        let open: Vec<(&BarbershopSummary, &Vec<String>)> = catalog
            .iter()
            .filter_map(|shop| {
                slots
                    .get(&shop.barbershop_id)
                    .filter(|s| !s.is_empty())
                    .map(|s| (shop, s))
            })
            .collect();

        let day = format_date_long(date);
        if open.is_empty() {
            return format!(
                "Infelizmente não há horários disponíveis para {day}. Que tal tentar outra data?"
            );
        }

        if let Some(time) = time {
            let label = time.format("%H:%M").to_string();
            let matching: Vec<_> = open.iter().filter(|(_, s)| s.contains(&label)).collect();

            if !matching.is_empty() {
                let mut out = format!("Boa notícia! Tem horário às {label} em {day}:\n");
                for (shop, _) in &matching {
                    out.push('\n');
                    out.push_str(&shop_block(shop));
                }
                out.push_str(if matching.len() == 1 {
                    "\nPosso agendar? É só confirmar."
                } else {
                    "\nQual barbearia você prefere? Depois é só confirmar."
                });
                return out;
            }

            let mut out = format!("Não encontrei horário às {label} em {day}, mas há outras opções:\n");
            for (shop, s) in &open {
                out.push('\n');
                out.push_str(&shop_block(shop));
                out.push_str(&format!("Horários: {}\n", self.suggest_time_slots(s, SUGGESTED_SLOTS).join(", ")));
            }
            out.push_str("\nQual horário fica melhor para você?");
            return out;
        }

        let mut out = format!("Encontrei horários para {day}:\n");
        for (shop, s) in &open {
            out.push('\n');
            out.push_str(&shop_block(shop));
            out.push_str(&format!("Horários: {}\n", self.suggest_time_slots(s, SUGGESTED_SLOTS).join(", ")));
        }
        out.push_str("\nQual barbearia, serviço e horário você prefere?");
        out
    }
}

/// Up to `count` evenly spaced entries, always including the first and
/// last slot of the day.
pub fn suggest_time_slots(slots: &[String], count: usize) -> Vec<String> {
    if slots.len() <= count {
        return slots.to_vec();
    }
    if count < 2 {
        return slots.iter().take(count).cloned().collect();
    }
    (0..count)
        .map(|i| slots[i * (slots.len() - 1) / (count - 1)].clone())
        .collect()
}

pub fn is_confirmation(text: &str) -> bool {
    let lower = text.to_lowercase();
    if CONFIRMATION_PHRASES.iter().any(|p| lower.contains(p)) {
        return true;
    }
    lower
        .split(|c: char| !c.is_alphanumeric())
        .any(|w| CONFIRMATION_WORDS.contains(&w))
}

pub fn format_price(price: f64) -> String {
    let cents = (price * 100.0).round() as i64;
    format!("R$ {},{:02}", cents / 100, cents % 100)
}

pub fn format_date_long(date: NaiveDate) -> String {
    const MONTHS: [&str; 12] = [
        "janeiro", "fevereiro", "março", "abril", "maio", "junho", "julho", "agosto", "setembro", "outubro",
        "novembro", "dezembro",
    ];
    let weekday = match date.weekday() {
        Weekday::Mon => "segunda-feira",
        Weekday::Tue => "terça-feira",
        Weekday::Wed => "quarta-feira",
        Weekday::Thu => "quinta-feira",
        Weekday::Fri => "sexta-feira",
        Weekday::Sat => "sábado",
        Weekday::Sun => "domingo",
    };
    format!(
        "{weekday}, {} de {} de {}",
        date.day(),
        MONTHS[date.month0() as usize],
        date.year()
    )
}

fn weekday_from_word(word: &str) -> Option<Weekday> {
    Some(match word {
        "segunda" | "monday" => Weekday::Mon,
        "terça" | "terca" | "tuesday" => Weekday::Tue,
        "quarta" | "wednesday" => Weekday::Wed,
        "quinta" | "thursday" => Weekday::Thu,
        "sexta" | "friday" => Weekday::Fri,
        "sábado" | "sabado" | "saturday" => Weekday::Sat,
        "domingo" | "sunday" => Weekday::Sun,
        _ => return None,
    })
}

/// Messages after the latest user message.
fn current_turn(messages: &[ChatMessage]) -> impl Iterator<Item = &ChatMessage> {
    let start = messages
        .iter()
        .rposition(|m| m.role == Role::User)
        .map_or(0, |i| i + 1);
    messages[start..].iter()
}

fn invocations_of<'a>(messages: &'a [ChatMessage], tool: ToolName) -> impl Iterator<Item = &'a ToolInvocation> {
    messages
        .iter()
        .flat_map(ChatMessage::tool_invocations)
        .filter(move |inv| inv.tool_name == tool.as_str() && inv.is_resolved())
}

/// The most recent search result: the barbershop list, or the error it
/// reported.
fn latest_catalog(messages: &[ChatMessage]) -> Option<Result<Vec<BarbershopSummary>, String>> {
    let inv = invocations_of(messages, ToolName::SearchBarbershops).last()?;
    Some(match &inv.state {
        ToolState::OutputAvailable(output) => serde_json::from_value(output.clone()).map_err(|_| {
            output
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unexpected search result")
                .to_string()
        }),
        ToolState::OutputError(error) => Err(error.clone()),
        ToolState::InputAvailable => return None,
    })
}

/// Slot lists already fetched for `date`, by barbershop. A lookup that
/// failed counts as known and empty.
fn known_slots(messages: &[ChatMessage], date: NaiveDate) -> HashMap<String, Vec<String>> {
    let day = date.format("%Y-%m-%d").to_string();
    let mut known = HashMap::new();
    for inv in invocations_of(messages, ToolName::GetAvailableTimeSlots) {
        if inv.input.get("date").and_then(Value::as_str) != Some(day.as_str()) {
            continue;
        }
        let Some(shop_id) = inv.input.get("barbershopId").and_then(Value::as_str) else {
            continue;
        };
        let slots = inv
            .output()
            .and_then(|o| serde_json::from_value::<TimeSlots>(o.clone()).ok())
            .map(|t| t.available_time_slots)
            .unwrap_or_default();
        known.insert(shop_id.to_string(), slots);
    }
    known
}

fn missing_slot_lookups(
    catalog: &[BarbershopSummary],
    known: &HashMap<String, Vec<String>>,
    date: NaiveDate,
) -> Vec<PlannedCall> {
    let day = date.format("%Y-%m-%d").to_string();
    catalog
        .iter()
        .filter(|shop| !known.contains_key(&shop.barbershop_id))
        .map(|shop| {
            PlannedCall::new(
                ToolName::GetAvailableTimeSlots,
                json!({ "barbershopId": shop.barbershop_id, "date": day }),
            )
        })
        .collect()
}

/// The outcome of the latest checkout after the latest user message. A
/// success anywhere in the turn wins over later refusals.
fn checkout_result_this_turn(messages: &[ChatMessage]) -> Option<CheckoutOutput> {
    let results: Vec<CheckoutOutput> = current_turn(messages)
        .flat_map(ChatMessage::tool_invocations)
        .filter(|inv| inv.tool_name == ToolName::CreateCheckoutSession.as_str())
        .filter_map(|inv| match &inv.state {
            ToolState::OutputAvailable(output) => serde_json::from_value(output.clone()).ok(),
            ToolState::OutputError(error) => Some(CheckoutOutput::failed(error.clone())),
            ToolState::InputAvailable => None,
        })
        .collect();

    match results.iter().position(|r| r.success) {
        Some(i) => results.into_iter().nth(i),
        None => results.into_iter().last(),
    }
}

fn narrate_checkout(result: &CheckoutOutput) -> &'static str {
    if result.success && result.url.is_some() {
        return CHECKOUT_REDIRECT;
    }
    match result.error.as_deref() {
        Some(UNAUTHORIZED) => CHECKOUT_LOGIN_REQUIRED,
        Some(DUPLICATE_BOOKING) => CHECKOUT_ALREADY_CREATED,
        _ => CHECKOUT_FAILED,
    }
}

/// Picks the barbershop offering `time` (preferring one the user named)
/// and the service that best matches what the user asked for.
fn select_booking<'a>(
    catalog: &'a [BarbershopSummary],
    slots: &HashMap<String, Vec<String>>,
    time: NaiveTime,
    user_texts: &[String],
) -> Option<(&'a BarbershopSummary, &'a ServiceSummary)> {
    let label = time.format("%H:%M").to_string();
    let said = user_texts.join(" ").to_lowercase();
    let said_words: Vec<&str> = said.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()).collect();

    let offering: Vec<&BarbershopSummary> = catalog
        .iter()
        .filter(|shop| {
            slots
                .get(&shop.barbershop_id)
                .is_some_and(|s| s.contains(&label))
        })
        .filter(|shop| !shop.services.is_empty())
        .collect();

    let shop = offering
        .iter()
        .find(|shop| said.contains(&shop.name.to_lowercase()))
        .or_else(|| offering.first())
        .copied()?;

    let score = |service: &ServiceSummary| {
        service
            .name
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.chars().count() > 3 && said_words.contains(w))
            .count()
    };
    // max_by_key keeps the last maximum; reversing keeps catalog order on ties.
    let service = shop.services.iter().rev().max_by_key(|&s| score(s))?;

    Some((shop, service))
}

fn shop_block(shop: &BarbershopSummary) -> String {
    let services = shop
        .services
        .iter()
        .map(|s| format!("{} ({})", s.name, format_price(s.price)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("**{}**\n{}\nServiços: {}\n", shop.name, shop.address, services)
}

fn present_catalog(catalog: &[BarbershopSummary]) -> String {
    let mut out = String::from("Estas são as barbearias disponíveis:\n");
    for shop in catalog {
        out.push('\n');
        out.push_str(&shop_block(shop));
    }
    out.push_str("\nPara qual dia você gostaria de agendar?");
    out
}
