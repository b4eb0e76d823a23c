use wrenmail::sanitize::body_from_raw;

#[test]
fn attachment_part_is_collected_with_filename_and_encoded_bytes() {
    let raw = concat!(
        "Subject: test\r\n",
        "Content-Type: multipart/mixed; boundary=\"b\"\r\n",
        "\r\n",
        "--b\r\n",
        "Content-Type: text/plain; charset=utf-8\r\n",
        "\r\n",
        "Hello\r\n",
        "--b\r\n",
        "Content-Type: application/pdf; name=\"file.pdf\"\r\n",
        "Content-Disposition: attachment; filename=\"file.pdf\"\r\n",
        "Content-Transfer-Encoding: base64\r\n",
        "\r\n",
        "SGVsbG8=\r\n",
        "--b--\r\n",
    )
    .as_bytes()
    .to_vec();

    let body = body_from_raw(1, raw, false);

    assert_eq!(body.plain_text.as_deref(), Some("Hello\r\n"));
    let attachment = body
        .parts
        .iter()
        .find(|p| p.mime_type == "application/pdf")
        .expect("pdf part collected");
    assert_eq!(attachment.filename.as_deref(), Some("file.pdf"));
    assert!(!attachment.encoded_bytes.is_empty());
}
