use std::io;
use std::path::PathBuf;
use std::time::Duration;

use indicatif::ProgressBar;
use log::debug;

use crate::engine::{ClientEngine, OutboundMessage};
use crate::error::ClientError;

struct MenuOption {
    code: u32,
    requires_registration: bool,
    description: &'static str,
}

const MENU_OPTIONS: &[MenuOption] = &[
    MenuOption { code: 10, requires_registration: false, description: "Register" },
    MenuOption { code: 20, requires_registration: true, description: "Request for client list" },
    MenuOption { code: 30, requires_registration: true, description: "Request for public key" },
    MenuOption { code: 40, requires_registration: true, description: "Request for waiting messages" },
    MenuOption { code: 50, requires_registration: true, description: "Send a text message" },
    MenuOption { code: 51, requires_registration: true, description: "Send a request for symmetric key" },
    MenuOption { code: 52, requires_registration: true, description: "Send your symmetric key" },
    MenuOption { code: 53, requires_registration: true, description: "Send a file" },
    MenuOption { code: 0, requires_registration: false, description: "Exit client" },
];

/// Interactive menu. Every option maps onto exactly one engine call; the
/// engine can be driven by any other front end the same way.
pub struct Menu {
    engine: ClientEngine,
    registered: bool,
}

impl Menu {
    pub fn new(engine: ClientEngine, registered: bool) -> Menu {
        Menu { engine, registered }
    }

    pub fn run(&mut self) {
        loop {
            self.display();
            if !self.handle_choice() {
                return;
            }
        }
    }

    fn display(&self) {
        println!();
        match self.engine.username() {
            Some(username) if self.registered => {
                println!("Hello {username}, MessageU client at your service.")
            }
            _ => println!("MessageU client at your service."),
        }
        println!();
        for option in MENU_OPTIONS {
            println!("{:>2}) {}", option.code, option.description);
        }
    }

    /// Returns false when the user chose to exit.
    fn handle_choice(&mut self) -> bool {
        let option = loop {
            let input = read_input("");
            match MENU_OPTIONS.iter().find(|option| input == option.code.to_string()) {
                Some(option) => break option,
                None => println!("Invalid input. Please try again.."),
            }
        };

        println!("{}", option.description);
        if option.requires_registration && !self.registered {
            println!("You must register first!");
            return true;
        }

        let outcome = match option.code {
            0 => return false,
            10 => self.register(),
            20 => self.list_clients(),
            30 => self.request_public_key(),
            40 => self.fetch_pending(),
            50 => self.send_text(),
            51 => self.send_sym_key_request(),
            52 => self.send_sym_key(),
            53 => self.send_file(),
            _ => Ok(()),
        };
        if let Err(e) = outcome {
            println!("{e}");
        }
        true
    }

    fn register(&mut self) -> Result<(), ClientError> {
        if self.registered {
            println!("You have already registered!");
            return Ok(());
        }
        let username = read_input("Please type your username..");
        self.engine.register(&username)?;
        self.registered = true;
        println!("Successfully registered on server.");
        Ok(())
    }

    fn list_clients(&mut self) -> Result<(), ClientError> {
        let usernames = self.engine.request_clients_list()?;
        if usernames.is_empty() {
            println!("Server has no users registered.");
            return Ok(());
        }
        println!("Registered users:");
        for username in usernames {
            println!("{username}");
        }
        Ok(())
    }

    fn request_public_key(&mut self) -> Result<(), ClientError> {
        let username = read_input("Please type a username..");
        self.engine.request_public_key(&username)?;
        println!("{username}'s public key was retrieved successfully.");
        Ok(())
    }

    fn fetch_pending(&mut self) -> Result<(), ClientError> {
        let spinner = spinner("Fetching pending messages");
        let result = self.engine.fetch_pending_messages();
        spinner.finish_and_clear();

        let messages = result?;
        if messages.is_empty() {
            println!("There are no pending messages for you.");
        }
        for message in &messages {
            debug!("message {} from {}", message.message_id, message.from);
            println!("From: {}", message.from);
            println!("Content:");
            println!("{}", message.content);
            println!("-----<EOM>-----");
            println!();
        }
        if !self.engine.last_error().is_empty() {
            print!("{}", self.engine.last_error());
        }
        Ok(())
    }

    fn send_text(&mut self) -> Result<(), ClientError> {
        let username = read_input("Please type a username..");
        let text = read_input("Enter message: ");
        let id = self
            .engine
            .send_message(&username, OutboundMessage::Text(text))?;
        println!("Message was sent successfully (message id {id}).");
        Ok(())
    }

    fn send_sym_key_request(&mut self) -> Result<(), ClientError> {
        let username = read_input("Please type a username..");
        let id = self
            .engine
            .send_message(&username, OutboundMessage::SymKeyRequest)?;
        println!("Symmetric key request was sent successfully (message id {id}).");
        Ok(())
    }

    fn send_sym_key(&mut self) -> Result<(), ClientError> {
        let username = read_input("Please type a username..");
        let id = self.engine.send_message(&username, OutboundMessage::SymKey)?;
        println!("Symmetric key was sent successfully (message id {id}).");
        Ok(())
    }

    fn send_file(&mut self) -> Result<(), ClientError> {
        let username = read_input("Please type a username..");
        let path = PathBuf::from(read_input("Enter filepath: "));
        let spinner = spinner("Sending file");
        let result = self
            .engine
            .send_message(&username, OutboundMessage::File(path));
        spinner.finish_and_clear();
        let id = result?;
        println!("File was sent successfully (message id {id}).");
        Ok(())
    }
}

/// Read one trimmed, non-empty line from stdin. Exits cleanly on EOF.
fn read_input(prompt: &str) -> String {
    if !prompt.is_empty() {
        println!("{prompt}");
    }
    loop {
        let mut input = String::new();
        match io::stdin().read_line(&mut input) {
            Ok(0) => {
                println!();
                std::process::exit(0);
            }
            Ok(_) => {
                let trimmed = input.trim();
                if !trimmed.is_empty() {
                    return trimmed.to_string();
                }
            }
            Err(e) => {
                eprintln!("Failed to read input: {e}");
            }
        }
    }
}

fn spinner(message: &'static str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.enable_steady_tick(Duration::from_millis(100));
    bar.set_message(message);
    bar
}
