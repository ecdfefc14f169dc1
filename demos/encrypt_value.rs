use stackconf::{encryption, Password};
use std::io::{self, BufRead, Write};

fn read_line(prompt: &str) -> Option<String> {
    print!("{prompt}");
    io::stdout().flush().ok()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line).ok()?;
    Some(line.trim_end_matches(['\r', '\n']).to_string())
}

fn main() -> stackconf::Result<()> {
    let message = read_line("Value to encrypt: ").unwrap_or_default();
    let password = Password::new(read_line("Password: ").unwrap_or_default());

    let token = encryption::encrypt(message.as_bytes(), &password)?;
    println!("Token: {token}");

    // Decrypt again, allowing a few attempts at the password
    let plain = encryption::decrypt_with_retries(&token, |attempt| {
        read_line(&format!("Password again (attempt {attempt}): ")).map(Password::new)
    })?;
    println!("Round trip ok: {}", plain.as_slice() == message.as_bytes());

    Ok(())
}
