mod nntp_pipeline;
mod nntp_session;
mod orchestrator;
