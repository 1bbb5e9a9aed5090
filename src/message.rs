//! Client-facing quote text, ready to paste into a chat. Nothing is sent from here.

use chrono::NaiveTime;

use crate::model::{Amount, YearMonth};

const MONTHS_ES: [&str; 12] = [
    "enero",
    "febrero",
    "marzo",
    "abril",
    "mayo",
    "junio",
    "julio",
    "agosto",
    "septiembre",
    "octubre",
    "noviembre",
    "diciembre",
];

pub fn month_name(month: YearMonth) -> &'static str {
    MONTHS_ES[(month.month() - 1) as usize]
}

/// `1234567` → `1.234.567`
pub fn format_amount(amount: Amount) -> String {
    let digits = amount.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if amount < 0 {
        out.push('-');
    }
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push('.');
        }
        out.push(c);
    }
    out
}

/// `120` → `2hs`, `90` → `1:30hs`
pub fn format_duration(minutes: u32) -> String {
    let (h, m) = (minutes / 60, minutes % 60);
    if m == 0 {
        format!("{h}hs")
    } else {
        format!("{h}:{m:02}hs")
    }
}

#[derive(Debug, Clone)]
pub struct QuoteMessage<'a> {
    pub client_name: &'a str,
    pub month: YearMonth,
    pub room_name: &'a str,
    pub headcount: u32,
    /// Already formatted day list or quote detail.
    pub days: &'a str,
    pub start: NaiveTime,
    pub duration_minutes: u32,
    pub total: Amount,
}

impl QuoteMessage<'_> {
    pub fn render(&self) -> String {
        format!(
            "Hola {client}! 👋\n\n\
             Te paso el detalle de alquiler para *{month}*:\n\n\
             📍 *Espacio:* {room}\n\
             👥 *Personas:* {pax}\n\
             📅 *Días:* {days}\n\
             ⏰ *Horario:* {start} ({duration})\n\n\
             💰 *Valor Actualizado:* ${total}\n\n\
             _Avisame para dejar confirmado el mes!_",
            client = self.client_name,
            month = month_name(self.month).to_uppercase(),
            room = self.room_name,
            pax = self.headcount,
            days = self.days,
            start = self.start.format("%H:%M"),
            duration = format_duration(self.duration_minutes),
            total = format_amount(self.total),
        )
    }
}
