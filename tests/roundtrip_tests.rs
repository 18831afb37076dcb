//! Composed messages parsed back with an independent MIME parser.

use std::sync::Arc;

use integrations_mail_dispatch::mocks::MockConnectionFactory;
use integrations_mail_dispatch::{
    Attachment, CancellationToken, ContentKind, MessageComposer, SmtpClient, SmtpConfig,
};
use mail_parser::{Address, MessageParser, MimeHeaders};

fn mailboxes(address: Option<&Address>) -> Vec<(Option<String>, String)> {
    let Some(address) = address else {
        return Vec::new();
    };
    let entries: Vec<_> = match address {
        Address::List(list) => list.iter().collect(),
        Address::Group(groups) => groups.iter().flat_map(|g| g.addresses.iter()).collect(),
    };
    entries
        .into_iter()
        .filter_map(|a| {
            let email = a.address.as_ref()?.to_string();
            Some((a.name.as_ref().map(|n| n.to_string()), email))
        })
        .collect()
}

#[test]
fn plain_headers_parse_back() {
    let composed = MessageComposer::new().compose(
        ContentKind::Plain,
        "sender@example.com",
        "one@example.com, Two <two@example.com>",
        "Quarterly numbers",
        "Line one\nLine two",
        &[],
    );

    let message = MessageParser::default().parse(composed.as_slice()).unwrap();

    assert_eq!(
        mailboxes(message.from()),
        vec![(None, "sender@example.com".to_string())]
    );
    let to: Vec<String> = mailboxes(message.to()).into_iter().map(|(_, e)| e).collect();
    assert_eq!(to, vec!["one@example.com", "two@example.com"]);
    assert_eq!(message.subject(), Some("Quarterly numbers"));
    assert_eq!(
        message.body_text(0).unwrap().replace("\r\n", "\n").trim_end(),
        "Line one\nLine two"
    );
}

#[test]
fn encoded_words_decode_to_the_original_text() {
    let composed = MessageComposer::new().compose(
        ContentKind::Html,
        "José Núñez <jose@example.com>",
        "team@example.com",
        "Résumé – août",
        "<p>Bonjour</p>",
        &[],
    );

    let message = MessageParser::default().parse(composed.as_slice()).unwrap();

    assert_eq!(message.subject(), Some("Résumé – août"));
    assert_eq!(
        mailboxes(message.from()),
        vec![(Some("José Núñez".to_string()), "jose@example.com".to_string())]
    );
    assert!(message.body_html(0).unwrap().contains("<p>Bonjour</p>"));
}

#[test]
fn attachment_bytes_survive_base64() {
    let data: Vec<u8> = (0..=255u8).cycle().take(3000).collect();
    let attachment = Attachment::new("data.bin", "application/octet-stream", data.clone());

    let composed = MessageComposer::new().compose(
        ContentKind::Plain,
        "sender@example.com",
        "reader@example.com",
        "Data",
        "see attached",
        &[attachment],
    );

    let message = MessageParser::default().parse(composed.as_slice()).unwrap();

    assert_eq!(message.body_text(0).unwrap().trim_end(), "see attached");
    let parts: Vec<_> = message.attachments().collect();
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].attachment_name(), Some("data.bin"));
    assert_eq!(parts[0].contents(), data.as_slice());
}

#[tokio::test]
async fn delivered_payload_parses_back() {
    let factory = MockConnectionFactory::new();
    let config = SmtpConfig::builder()
        .host("mail.example.com")
        .pool_size(1)
        .no_retry()
        .build()
        .unwrap();
    let client = SmtpClient::builder()
        .config(config)
        .connection_factory(Arc::new(factory.clone()))
        .build()
        .await
        .unwrap();

    client
        .send_with_attachments(
            &CancellationToken::new(),
            "sender@example.com",
            "reader@example.com",
            "Invoice",
            "Attached.",
            vec![Attachment::from_bytes("invoice.pdf", b"%PDF-1.4 fake".to_vec())],
        )
        .await
        .unwrap();

    let delivered = factory.server().delivered();
    let message = MessageParser::default().parse(delivered[0].data.as_slice()).unwrap();
    assert_eq!(message.subject(), Some("Invoice"));

    let part = message.attachments().next().unwrap();
    assert_eq!(part.attachment_name(), Some("invoice.pdf"));
    assert_eq!(part.contents(), b"%PDF-1.4 fake");
    assert_eq!(
        part.content_type().map(|ct| ct.ctype()),
        Some("application")
    );
}
