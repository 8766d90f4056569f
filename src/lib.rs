//! Multi-tenant WhatsApp assistant for car dealerships.
//!
//! Each tenant (a dealership) pairs its own WhatsApp number. Inbound messages
//! are answered by an LLM that can search the tenant's catalog, and sales
//! staff can list new cars by sending photos followed by the car details.

pub mod admin;
pub mod bot;
pub mod config;
pub mod llm;
pub mod media;
pub mod service;
pub mod store;
pub mod whatsapp;
