//! Plain-text renderings of a settled session for sharing.

use std::fmt::Write;

use rust_decimal::Decimal;

use tally_core::settlement::round_money;
use tally_core::SessionView;

/// One line per distinct item: `"{quantity}x {name} ({price})"`.
pub fn combined_order_text(view: &SessionView) -> String {
    view.combined_order
        .iter()
        .map(|line| format!("{}x {} ({})", line.quantity, line.name, money(line.price)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// CSV export: per-participant costs, the summary, then the combined order.
pub fn settlement_csv(view: &SessionView) -> String {
    let mut csv = String::from("Participant,Items,Items Total,Delivery Share,Total,Payment Status\n");
    for cost in &view.per_participant {
        let items = view
            .orders
            .iter()
            .find(|o| o.participant_id == cost.participant_id)
            .map(|o| {
                o.items
                    .iter()
                    .map(|i| format!("{} x{} ({})", i.name, i.quantity, money(i.price)))
                    .collect::<Vec<_>>()
                    .join("; ")
            })
            .unwrap_or_default();
        let _ = writeln!(
            csv,
            "{},{},{},{},{},{}",
            quote(cost.participant_id.as_str()),
            quote(&items),
            money(cost.items_total),
            money(cost.delivery_share),
            money(cost.total),
            if cost.payment_sent { "Paid" } else { "Pending" }
        );
    }

    let summary = &view.summary;
    let _ = write!(
        csv,
        "\nSummary\nTotal Food,{}\nDelivery Fee,{}\nGrand Total,{}\n",
        money(summary.total_food),
        money(summary.total_delivery),
        money(summary.grand_total)
    );

    csv.push_str("\nCombined Order\nItem,Quantity,Unit Price\n");
    for line in &view.combined_order {
        let _ = writeln!(csv, "{},{},{}", quote(&line.name), line.quantity, money(line.price));
    }
    csv
}

/// Two decimal places, always.
fn money(amount: Decimal) -> String {
    format!("{:.2}", round_money(amount))
}

fn quote(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "\"\""))
}
